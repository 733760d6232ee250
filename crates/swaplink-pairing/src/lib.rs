//! swaplink-pairing: who streams to whom, and for how long.
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `coordinator` | Idle / Pairing / Paired state machine, tie-break rules |
//! | `shuffle`     | least-visited partner rotation                         |
//! | `client`      | outbound `/pair/request` and `/pair/confirm` calls     |
//! | `resolve`     | confirming address → stable partner hostname           |
//! | `retry`       | fixed-delay retry for timed-out calls                  |
//! | `service`     | runs the coordinator on a task, performs its actions   |

pub mod client;
pub mod coordinator;
pub mod resolve;
pub mod retry;
pub mod service;
pub mod shuffle;

pub use client::{HttpPairingClient, PairingClient};
pub use coordinator::{Action, CoordinatorConfig, PairingCoordinator};
pub use retry::RetryPolicy;
pub use service::{DiscoveryControl, PairingHandle, PairingService, TargetControl};
pub use shuffle::ShuffleSelector;
