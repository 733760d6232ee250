use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwapLinkError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Configuration file {path} unreadable: {reason}")]
    ConfigurationFile { path: String, reason: String },
}

// MARK: - TransportError

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport already running")]
    AlreadyRunning,

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

// MARK: - PacketError

/// Why a received datagram was rejected before reassembly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Datagram too short: {len} bytes")]
    TooShort { len: usize },

    #[error("Payload length {declared} exceeds {available} available bytes")]
    TruncatedPayload { declared: u32, available: usize },

    #[error("Payload length {declared} exceeds max payload {max}")]
    PayloadTooLarge { declared: u32, max: usize },

    #[error("Part index {index} out of range for {total} parts")]
    PartOutOfRange { index: u16, total: u16 },

    #[error("Total parts {total} outside 1..={max}")]
    TotalPartsOutOfRange { total: u16, max: u16 },
}

// MARK: - DecodeError

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Failed to decode frame {frame_id}: {reason}")]
    DecodeFailed { frame_id: u32, reason: String },
}

// MARK: - ProbeError

/// Identity probe failures. These are expected discovery noise.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe to {host} timed out")]
    Timeout { host: String },

    #[error("Probe to {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Probe to {host} returned an unexpected payload: {reason}")]
    UnexpectedPayload { host: String, reason: String },
}

// MARK: - PairingError

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Pairing request to {host} timed out")]
    Timeout { host: String },

    #[error("Peer {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Peer {host} rejected pairing: {reason}")]
    Rejected { host: String, reason: String },

    #[error("Malformed pairing response from {host}: {reason}")]
    Malformed { host: String, reason: String },
}

impl PairingError {
    /// Timeouts are the only failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
