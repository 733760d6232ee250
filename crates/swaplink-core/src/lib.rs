pub mod config;
pub mod errors;
pub mod events;
pub mod net;
pub mod protocol;
pub mod types;

pub use config::{NodeConfig, PairingMode};
pub use errors::SwapLinkError;
pub use events::{event_channel, EventReceiver, EventSender, NodeEvent, SessionEndReason};
pub use types::*;
