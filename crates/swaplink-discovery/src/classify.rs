use swaplink_core::net::is_loopback_host;
use swaplink_core::protocol::IdentityInfo;

/// What a successful probe turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// We probed ourselves.
    SelfIdentity,
    /// Loopback address; never a real peer.
    Loopback,
    Peer,
}

pub fn classify(host: &str, info: &IdentityInfo, local_identity: &str) -> Verdict {
    if info.id == local_identity {
        Verdict::SelfIdentity
    } else if is_loopback_host(host) {
        Verdict::Loopback
    } else {
        Verdict::Peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> IdentityInfo {
        IdentityInfo::ready("SWAPLINK", "dev", id)
    }

    #[test]
    fn self_wins_over_loopback() {
        assert_eq!(classify("127.0.0.1", &info("me"), "me"), Verdict::SelfIdentity);
        assert_eq!(classify("swaplink-04.local", &info("me"), "me"), Verdict::SelfIdentity);
    }

    #[test]
    fn loopback_candidates_are_discarded() {
        for host in ["localhost", "127.0.0.1", "::1"] {
            assert_eq!(classify(host, &info("other"), "me"), Verdict::Loopback);
        }
    }

    #[test]
    fn others_are_peers() {
        assert_eq!(classify("10.1.1.9", &info("id-b"), "id-a"), Verdict::Peer);
    }
}
