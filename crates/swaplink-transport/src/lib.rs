//! swaplink-transport: fragmenting UDP frame transport.
//!
//! A node streams its most recent frame to one partner while receiving the
//! partner's frames on the same socket.
//!
//! | Module            | Role                                              |
//! |-------------------|---------------------------------------------------|
//! | `packet`          | 12-byte header codec and validation               |
//! | `fragment`        | send-side split of one frame into datagrams       |
//! | `assembler`       | receive-side slot arena and monotonicity guard    |
//! | `decode`          | `FrameDecoder` trait and bounded worker pool      |
//! | `target`          | hostname resolution off the hot loop              |
//! | `frame_transport` | socket-owning loop thread and lifecycle           |

pub mod assembler;
pub mod decode;
pub mod fragment;
pub mod frame_transport;
pub mod packet;
pub mod stats;
pub mod target;

pub use assembler::{AssembledFrame, FrameAssembler, Ingest};
pub use decode::{DecodePool, FrameDecoder, JpegFrameDecoder};
pub use frame_transport::{FrameSink, FrameTransport};
pub use packet::{PacketHeader, PacketLimits};
pub use stats::TransportStats;
pub use target::TargetHandle;
