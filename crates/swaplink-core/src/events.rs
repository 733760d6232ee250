//! Typed node events.
//!
//! Every subsystem reports through one channel of [`NodeEvent`]s instead of
//! per-subsystem listener callbacks. Consumers (status display, renderer,
//! logging) match on the variant they care about.

use tokio::sync::mpsc;

use crate::types::DecodedFrame;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A candidate passed identity verification.
    Discovered { hostname: String, identity: String },

    /// A session started; frames now stream to `hostname`.
    Paired { identity: String, hostname: String },

    /// The session with `identity` is over.
    SessionEnded {
        identity: String,
        reason: SessionEndReason,
    },

    /// A reassembled frame made it through the decode stage.
    FrameReady(DecodedFrame),

    /// The transport loop hit its consecutive-error limit and stopped.
    TransportFailed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// Session timer elapsed.
    Expired,
    /// The transport reported a failure for the current partner.
    TransportFailed,
    /// Node shutting down.
    Stopped,
}

impl std::fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::TransportFailed => write!(f, "transport failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<NodeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// Create the node-wide event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
