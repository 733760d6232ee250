//! Subnet sweep candidates from the local IPv4 /24.

use std::net::{IpAddr, Ipv4Addr};

/// Networks created by emulators, hypervisors and container runtimes. A
/// node whose primary address sits in one of these skips the sweep.
const VIRTUAL_RANGES: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(10, 0, 2, 0), 24),      // QEMU / Android emulator user-net
    (Ipv4Addr::new(10, 0, 3, 0), 24),      // LXC
    (Ipv4Addr::new(192, 168, 56, 0), 24),  // VirtualBox host-only
    (Ipv4Addr::new(192, 168, 122, 0), 24), // libvirt default
    (Ipv4Addr::new(172, 17, 0, 0), 16),    // Docker bridge
];

/// Detect the primary LAN IPv4 address by probing an external socket.
///
/// Nothing is sent; connecting a UDP socket only consults the routing table.
pub fn detect_local_ipv4() -> Option<Ipv4Addr> {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .ok()
        .and_then(|a| match a.ip() {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
}

pub fn is_virtual_range(ip: Ipv4Addr) -> bool {
    VIRTUAL_RANGES.iter().any(|&(net, prefix)| {
        let mask = u32::MAX << (32 - prefix);
        u32::from(ip) & mask == u32::from(net) & mask
    })
}

/// Up to `limit` host addresses of `local`'s /24, nearest first, never
/// including `local` itself. Empty when `local` is in a virtual range.
pub fn sweep_candidates(local: Ipv4Addr, limit: usize) -> Vec<Ipv4Addr> {
    if is_virtual_range(local) || local.is_loopback() {
        return Vec::new();
    }
    let [a, b, c, own] = local.octets();
    let own = own as i16;

    let mut hosts: Vec<u8> = (1..=254u8).filter(|&h| h as i16 != own).collect();
    hosts.sort_by_key(|&h| ((h as i16 - own).abs(), h));
    hosts
        .into_iter()
        .take(limit)
        .map(|h| Ipv4Addr::new(a, b, c, h))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_ranges_are_recognised() {
        assert!(is_virtual_range(Ipv4Addr::new(10, 0, 2, 15)));
        assert!(is_virtual_range(Ipv4Addr::new(192, 168, 122, 1)));
        assert!(is_virtual_range(Ipv4Addr::new(172, 17, 200, 3)));
        assert!(!is_virtual_range(Ipv4Addr::new(172, 18, 0, 3)));
        assert!(!is_virtual_range(Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[test]
    fn sweep_skips_virtual_networks() {
        assert!(sweep_candidates(Ipv4Addr::new(10, 0, 2, 15), 64).is_empty());
        assert!(sweep_candidates(Ipv4Addr::new(192, 168, 56, 101), 64).is_empty());
    }

    #[test]
    fn sweep_excludes_self_and_respects_limit() {
        let local = Ipv4Addr::new(192, 168, 1, 20);
        let hosts = sweep_candidates(local, 4);
        assert_eq!(
            hosts,
            vec![
                Ipv4Addr::new(192, 168, 1, 19),
                Ipv4Addr::new(192, 168, 1, 21),
                Ipv4Addr::new(192, 168, 1, 18),
                Ipv4Addr::new(192, 168, 1, 22),
            ]
        );
        let all = sweep_candidates(local, 1_000);
        assert_eq!(all.len(), 253);
        assert!(!all.contains(&local));
    }
}
