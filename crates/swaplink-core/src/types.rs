use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

// MARK: - PeerRecord

/// A peer whose identity probe succeeded. Unique by identity, not address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: String,
    pub hostname: String,
    pub last_verified_at: Instant,
}

// MARK: - PeerRegistry

/// In-memory set of verified peers keyed by identity.
///
/// Records are never removed; the scan universe is bounded, so the table is
/// too. A re-verification refreshes the timestamp and the (possibly churned)
/// hostname.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a record. Returns `true` for a first-time identity.
    pub fn record(&mut self, identity: &str, hostname: &str, now: Instant) -> bool {
        match self.peers.get_mut(identity) {
            Some(rec) => {
                rec.hostname = hostname.to_owned();
                rec.last_verified_at = now;
                false
            }
            None => {
                self.peers.insert(
                    identity.to_owned(),
                    PeerRecord {
                        identity: identity.to_owned(),
                        hostname: hostname.to_owned(),
                        last_verified_at: now,
                    },
                );
                true
            }
        }
    }

    pub fn hostname_for(&self, identity: &str) -> Option<&str> {
        self.peers.get(identity).map(|r| r.hostname.as_str())
    }

    /// Identities verified within `max_age` of `now`, sorted.
    pub fn fresh_identities(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .values()
            .filter(|r| now.saturating_duration_since(r.last_verified_at) <= max_age)
            .map(|r| r.identity.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// MARK: - Session

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Pairing,
    Paired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pairing => write!(f, "pairing"),
            Self::Paired => write!(f, "paired"),
        }
    }
}

/// The node's single session. `Idle` carries no partner.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub state: SessionState,
    pub partner_identity: Option<String>,
    pub partner_hostname: Option<String>,
    pub started_at: Option<Instant>,
    pub ends_at: Option<Instant>,
}

impl Default for Session {
    fn default() -> Self {
        Self::idle()
    }
}

impl Session {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            partner_identity: None,
            partner_hostname: None,
            started_at: None,
            ends_at: None,
        }
    }

    pub fn pairing(identity: &str, hostname: &str, now: Instant) -> Self {
        Self {
            state: SessionState::Pairing,
            partner_identity: Some(identity.to_owned()),
            partner_hostname: Some(hostname.to_owned()),
            started_at: Some(now),
            ends_at: None,
        }
    }

    pub fn paired(identity: &str, hostname: &str, now: Instant, duration: Duration) -> Self {
        Self {
            state: SessionState::Paired,
            partner_identity: Some(identity.to_owned()),
            partner_hostname: Some(hostname.to_owned()),
            started_at: Some(now),
            ends_at: Some(now + duration),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn is_paired(&self) -> bool {
        self.state == SessionState::Paired
    }

    pub fn is_paired_to(&self, identity: &str) -> bool {
        self.is_paired() && self.partner_identity.as_deref() == Some(identity)
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            partner_identity: self.partner_identity.clone(),
            partner_hostname: self.partner_hostname.clone(),
            remaining_secs: self
                .ends_at
                .map(|end| end.saturating_duration_since(now).as_secs()),
        }
    }
}

/// Serializable view of the session for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub partner_identity: Option<String>,
    pub partner_hostname: Option<String>,
    pub remaining_secs: Option<u64>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Session::idle().snapshot(Instant::now())
    }
}

// MARK: - TransportHealth

/// Counters exposed by the frame transport. `failed` is the fail-stop flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportHealth {
    pub running: bool,
    pub failed: bool,
    pub frames_sent: u64,
    pub frames_abandoned: u64,
    pub frames_oversized: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_invalid: u64,
    pub frames_assembled: u64,
    pub frames_stale: u64,
    pub frames_evicted: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub decode_dropped: u64,
    pub stream_resets: u64,
    pub loop_errors: u64,
}

// MARK: - DecodedFrame

/// Output of the decode stage, handed to whoever renders frames.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_id: u32,
    pub data: bytes::Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_keyed_by_identity() {
        let mut reg = PeerRegistry::new();
        let t0 = Instant::now();
        assert!(reg.record("id-a", "10.0.0.5", t0));
        assert!(!reg.record("id-a", "swaplink-03.local", t0 + Duration::from_secs(1)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.hostname_for("id-a"), Some("swaplink-03.local"));
    }

    #[test]
    fn fresh_identities_filters_by_age() {
        let mut reg = PeerRegistry::new();
        let t0 = Instant::now();
        reg.record("id-b", "h-b", t0);
        reg.record("id-a", "h-a", t0 + Duration::from_secs(60));
        let now = t0 + Duration::from_secs(61);
        assert_eq!(reg.fresh_identities(now, Duration::from_secs(30)), vec!["id-a"]);
        assert_eq!(
            reg.fresh_identities(now, Duration::from_secs(120)),
            vec!["id-a", "id-b"]
        );
    }

    #[test]
    fn paired_session_snapshot() {
        let now = Instant::now();
        let s = Session::paired("id-g", "peer-07", now, Duration::from_secs(300));
        assert!(s.is_paired_to("id-g"));
        assert!(!s.is_paired_to("id-h"));
        let snap = s.snapshot(now + Duration::from_secs(100));
        assert_eq!(snap.state, SessionState::Paired);
        assert_eq!(snap.remaining_secs, Some(200));
    }
}
