//! Reverse resolution of a confirming peer's address.
//!
//! The runtime resolver only does forward lookups, so the candidate name
//! comes from discovery: the hostname verified for the confirming identity
//! is forward-resolved and kept only if one of its addresses is the caller's.
//!
//! | Caller / candidate                     | Result       |
//! |----------------------------------------|--------------|
//! | no verified name                       | raw address  |
//! | loopback caller or loopback name       | raw address  |
//! | lookup fails or times out              | raw address  |
//! | name resolves elsewhere                | raw address  |
//! | name resolves to the caller            | name         |

use std::net::IpAddr;
use std::time::Duration;

use swaplink_core::net::is_loopback_host;
use tokio::net::lookup_host;
use tracing::debug;

/// Bound on the forward lookup; the confirming peer is waiting on the reply.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Stable hostname for `addr`, given the name discovery verified for the
/// confirming identity.
pub async fn resolve_partner(addr: IpAddr, verified: Option<&str>, timeout: Duration) -> String {
    let addr = addr.to_canonical();
    let Some(name) = verified else {
        return addr.to_string();
    };
    if addr.is_loopback() || is_loopback_host(name) {
        return addr.to_string();
    }

    let resolved: Vec<IpAddr> = match tokio::time::timeout(timeout, lookup_host((name, 0))).await {
        Ok(Ok(it)) => it.map(|a| a.ip().to_canonical()).collect(),
        Ok(Err(e)) => {
            debug!("[Pairing] lookup {} failed: {}", name, e);
            Vec::new()
        }
        Err(_) => {
            debug!("[Pairing] lookup {} timed out", name);
            Vec::new()
        }
    };
    pick_hostname(addr, name, &resolved)
}

/// `name` when it maps back to `addr`, else the raw address.
pub fn pick_hostname(addr: IpAddr, name: &str, resolved: &[IpAddr]) -> String {
    if !addr.is_loopback() && !is_loopback_host(name) && resolved.contains(&addr) {
        name.to_owned()
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn name_is_kept_only_when_it_points_back() {
        let caller = ip("192.168.1.70");
        let both = [ip("192.168.1.70"), ip("fe80::7")];
        assert_eq!(pick_hostname(caller, "swaplink-07.local", &both), "swaplink-07.local");
        assert_eq!(pick_hostname(caller, "swaplink-07.local", &[ip("192.168.1.71")]), "192.168.1.70");
        assert_eq!(pick_hostname(caller, "swaplink-07.local", &[]), "192.168.1.70");
    }

    #[test]
    fn loopback_never_becomes_the_partner_name() {
        let lo = ip("127.0.0.1");
        assert_eq!(pick_hostname(lo, "swaplink-07.local", &[lo]), "127.0.0.1");
        assert_eq!(pick_hostname(ip("10.0.0.4"), "localhost", &[ip("10.0.0.4")]), "10.0.0.4");
    }

    #[tokio::test]
    async fn falls_back_to_the_raw_address() {
        let caller = ip("192.168.1.70");
        assert_eq!(resolve_partner(caller, None, RESOLVE_TIMEOUT).await, "192.168.1.70");
        // localhost resolves, but to loopback, not the caller.
        assert_eq!(resolve_partner(caller, Some("localhost"), RESOLVE_TIMEOUT).await, "192.168.1.70");
        assert_eq!(
            resolve_partner(caller, Some("swaplink-99.invalid"), RESOLVE_TIMEOUT).await,
            "192.168.1.70"
        );
        let mapped = ip("::ffff:10.0.0.9");
        assert_eq!(resolve_partner(mapped, None, RESOLVE_TIMEOUT).await, "10.0.0.9");
    }

    #[tokio::test]
    async fn literal_name_matching_the_caller_is_kept() {
        let caller = ip("10.20.30.40");
        assert_eq!(resolve_partner(caller, Some("10.20.30.40"), RESOLVE_TIMEOUT).await, "10.20.30.40");
    }
}
