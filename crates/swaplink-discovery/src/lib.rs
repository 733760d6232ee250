//! swaplink-discovery: find other SwapLink nodes on the LAN.
//!
//! Candidates come from three independent sources and are only ever trusted
//! after an identity probe:
//!
//! | Source        | Module       | Candidate                      |
//! |---------------|--------------|--------------------------------|
//! | Name pattern  | `candidates` | `swaplink-01.local` … `-20`    |
//! | Subnet sweep  | `subnet`     | neighbours in the local /24    |
//! | Broadcast     | `broadcast`  | sender of an announcement      |

pub mod broadcast;
pub mod candidates;
pub mod classify;
pub mod probe;
pub mod scanner;
pub mod subnet;

pub use broadcast::Announcement;
pub use probe::{HttpProber, IdentityProber};
pub use scanner::{DiscoveryHandle, LocalNode, PeerDiscoveryScanner};

/// An address worth probing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub host: String,
    /// Port of the candidate's HTTP service.
    pub port: u16,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}
