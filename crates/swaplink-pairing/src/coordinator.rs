//! PairingCoordinator: the session state machine, free of I/O.
//!
//! ```text
//!            discovered (request and rejection cooldowns ok)
//!   Idle ─────────────────────────────────────────────► Pairing
//!    ▲  ◄──────────── request failed / rejected ──────────  │
//!    │                                                      │ accepted → confirm acknowledged
//!    │                  confirm received (acceptor side)    ▼
//!    └──── timer expired / transport failed ───────────  Paired
//! ```
//!
//! Every input returns the [`Action`]s the host must perform (HTTP calls,
//! transport retargeting, timers, discovery control, events). Timers carry a
//! generation number so one armed for an earlier session is ignored.
//!
//! Tie-break: the lexicographically smaller identity accepts. Both sides of a
//! pair may send a request, but a node only accepts requests from identities
//! larger than its own, so for any pair exactly one direction can succeed.
//! The losing direction is answered `tie_break` and cools down like any other
//! rejection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use swaplink_core::config::{PairingConfig, PairingMode};
use swaplink_core::errors::PairingError;
use swaplink_core::net::is_loopback_host;
use swaplink_core::protocol::{reasons, PairResponse};
use swaplink_core::{NodeEvent, PeerRegistry, Session, SessionEndReason, SessionSnapshot, SessionState};
use tracing::{debug, info, warn};

use crate::shuffle::ShuffleSelector;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub mode: PairingMode,
    pub request_cooldown: Duration,
    pub rejection_cooldown: Duration,
    pub session_duration: Duration,
    /// Peers not re-verified within this window are skipped by shuffle rotation.
    pub peer_freshness: Duration,
}

impl CoordinatorConfig {
    pub fn new(pairing: &PairingConfig, peer_freshness: Duration) -> Self {
        Self {
            mode: pairing.mode,
            request_cooldown: pairing.request_cooldown(),
            rejection_cooldown: pairing.rejection_cooldown(),
            session_duration: pairing.session_duration(),
            peer_freshness,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new(&PairingConfig::default(), Duration::from_secs(60))
    }
}

// ── Action ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Action {
    /// POST /pair/request to `hostname`.
    SendPairRequest { hostname: String },
    /// POST /pair/confirm to `hostname`.
    SendConfirm { hostname: String },
    /// Stream frames to `hostname`.
    SetTarget { hostname: String },
    ClearTarget,
    /// Call [`PairingCoordinator::on_session_timer`] with `generation` after `after`.
    ArmSessionTimer { generation: u64, after: Duration },
    PauseDiscovery,
    ResumeDiscovery,
    Emit(NodeEvent),
}

// ── PairingCoordinator ────────────────────────────────────────────────────────

pub struct PairingCoordinator {
    local_identity: String,
    config: CoordinatorConfig,
    session: Session,
    generation: u64,
    /// Last request sent, by hostname.
    requested_at: HashMap<String, Instant>,
    /// Last explicit rejection received, by hostname.
    rejected_at: HashMap<String, Instant>,
    /// Every verified peer reported by discovery.
    peers: PeerRegistry,
    shuffle: ShuffleSelector,
}

impl PairingCoordinator {
    pub fn new(local_identity: impl Into<String>, config: CoordinatorConfig) -> Self {
        Self {
            local_identity: local_identity.into(),
            config,
            session: Session::idle(),
            generation: 0,
            requested_at: HashMap::new(),
            rejected_at: HashMap::new(),
            peers: PeerRegistry::new(),
            shuffle: ShuffleSelector::new(),
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        self.session.snapshot(now)
    }

    /// Whether this node accepts a request from `identity`.
    pub fn may_accept(&self, identity: &str) -> bool {
        self.local_identity.as_str() < identity
    }

    // MARK: - Discovery input

    pub fn on_discovered(&mut self, hostname: &str, identity: &str, now: Instant) -> Vec<Action> {
        if identity == self.local_identity {
            return Vec::new();
        }
        self.peers.record(identity, hostname, now);

        if self.config.mode == PairingMode::Shuffle {
            return if self.session.is_idle() { self.rotate(now) } else { Vec::new() };
        }
        if !self.session.is_idle() {
            return Vec::new();
        }
        if within(self.requested_at.get(hostname), now, self.config.request_cooldown) {
            debug!("[Pairing] {} requested recently, skipping", hostname);
            return Vec::new();
        }
        if within(self.rejected_at.get(hostname), now, self.config.rejection_cooldown) {
            debug!("[Pairing] {} rejected us recently, skipping", hostname);
            return Vec::new();
        }

        info!("[Pairing] requesting {} ({})", hostname, identity);
        self.session = Session::pairing(identity, hostname, now);
        self.requested_at.insert(hostname.to_owned(), now);
        vec![Action::SendPairRequest { hostname: hostname.to_owned() }]
    }

    // MARK: - Acceptor side

    /// Answer `POST /pair/request`.
    pub fn handle_pair_request(&mut self, requester_identity: &str) -> PairResponse {
        if self.session.is_paired() {
            return if self.session.is_paired_to(requester_identity) {
                PairResponse::accepted(&self.local_identity)
            } else {
                debug!("[Pairing] rejecting {}: already paired", requester_identity);
                PairResponse::rejected(reasons::ALREADY_PAIRED)
            };
        }
        if self.may_accept(requester_identity) {
            info!("[Pairing] accepting request from {}", requester_identity);
            PairResponse::accepted(&self.local_identity)
        } else {
            debug!("[Pairing] rejecting {}: tie-break", requester_identity);
            PairResponse::rejected(reasons::TIE_BREAK)
        }
    }

    /// Answer `POST /pair/confirm`. `hostname` is the caller's address as
    /// already reverse-resolved by the host (see [`crate::resolve`]).
    pub fn confirm_pairing(
        &mut self,
        hostname: &str,
        peer_identity: &str,
        now: Instant,
    ) -> (PairResponse, Vec<Action>) {
        if self.session.is_paired() && !self.session.is_paired_to(peer_identity) {
            debug!("[Pairing] confirm from {} refused: already paired", peer_identity);
            return (PairResponse::rejected(reasons::ALREADY_PAIRED), Vec::new());
        }

        if self.session.is_paired_to(peer_identity) {
            // Re-confirmation: retarget only, the timer keeps running.
            debug!("[Pairing] re-confirmation from {} at {}", peer_identity, hostname);
            self.session.partner_hostname = Some(hostname.to_owned());
            return (PairResponse::confirmed(), vec![Action::SetTarget { hostname: hostname.to_owned() }]);
        }

        (PairResponse::confirmed(), self.begin_session(peer_identity, hostname, now, true))
    }

    /// Name discovery verified for `identity`, unless it is a loopback name.
    /// The reverse-resolution candidate for a confirming address.
    pub fn verified_hostname(&self, identity: &str) -> Option<&str> {
        self.peers.hostname_for(identity).filter(|h| !is_loopback_host(h))
    }

    // MARK: - Requester side

    /// The peer accepted our request; send the confirmation.
    pub fn on_pair_accepted(&mut self, hostname: &str, peer_identity: &str) -> Vec<Action> {
        if !self.is_pairing_with(hostname) {
            debug!("[Pairing] stale acceptance from {}", hostname);
            return Vec::new();
        }
        if self.session.partner_identity.as_deref() != Some(peer_identity) {
            warn!(
                "[Pairing] {} answered as {} but was verified as {:?}, abandoning",
                hostname, peer_identity, self.session.partner_identity
            );
            self.session = Session::idle();
            return Vec::new();
        }
        vec![Action::SendConfirm { hostname: hostname.to_owned() }]
    }

    /// Our confirmation was acknowledged; the session starts.
    pub fn on_confirm_acknowledged(&mut self, hostname: &str, now: Instant) -> Vec<Action> {
        if !self.is_pairing_with(hostname) {
            debug!("[Pairing] stale confirmation ack from {}", hostname);
            return Vec::new();
        }
        let identity = self.session.partner_identity.clone().unwrap_or_default();
        self.begin_session(&identity, hostname, now, true)
    }

    /// The request or confirmation to `hostname` failed for good (after retries).
    pub fn on_request_failed(&mut self, hostname: &str, error: &PairingError, now: Instant) -> Vec<Action> {
        if let PairingError::Rejected { reason, .. } = error {
            info!("[Pairing] {} rejected us ({}), cooling down", hostname, reason);
            self.rejected_at.insert(hostname.to_owned(), now);
        } else {
            debug!("[Pairing] request to {} failed: {}", hostname, error);
        }
        if self.is_pairing_with(hostname) {
            self.session = Session::idle();
        }
        Vec::new()
    }

    fn is_pairing_with(&self, hostname: &str) -> bool {
        self.session.state == SessionState::Pairing
            && self.session.partner_hostname.as_deref() == Some(hostname)
    }

    // MARK: - Session lifecycle

    fn begin_session(&mut self, identity: &str, hostname: &str, now: Instant, pause_discovery: bool) -> Vec<Action> {
        info!("[Pairing] paired with {} at {}", identity, hostname);
        self.session = Session::paired(identity, hostname, now, self.config.session_duration);
        self.generation += 1;

        let mut actions = vec![
            Action::SetTarget { hostname: hostname.to_owned() },
            Action::ArmSessionTimer { generation: self.generation, after: self.config.session_duration },
        ];
        if pause_discovery {
            actions.push(Action::PauseDiscovery);
        }
        actions.push(Action::Emit(NodeEvent::Paired {
            identity: identity.to_owned(),
            hostname: hostname.to_owned(),
        }));
        actions
    }

    /// End the current session (or abandon an attempt) and go back to Idle.
    /// Request and rejection history is cleared so the next discovery pass
    /// can pair with anyone again.
    pub fn end_session(&mut self, reason: SessionEndReason) -> Vec<Action> {
        let was = std::mem::take(&mut self.session);
        self.generation += 1;
        self.requested_at.clear();
        self.rejected_at.clear();

        match was.state {
            SessionState::Idle => Vec::new(),
            SessionState::Pairing => {
                debug!("[Pairing] abandoning attempt with {:?}", was.partner_hostname);
                Vec::new()
            }
            SessionState::Paired => {
                let identity = was.partner_identity.unwrap_or_default();
                info!("[Pairing] session with {} ended ({})", identity, reason);
                let mut actions = vec![Action::ClearTarget];
                if self.config.mode == PairingMode::Handshake {
                    actions.push(Action::ResumeDiscovery);
                }
                actions.push(Action::Emit(NodeEvent::SessionEnded { identity, reason }));
                actions
            }
        }
    }

    pub fn on_session_timer(&mut self, generation: u64, now: Instant) -> Vec<Action> {
        if generation != self.generation || !self.session.is_paired() {
            debug!("[Pairing] ignoring stale timer (gen {} vs {})", generation, self.generation);
            return Vec::new();
        }
        match self.config.mode {
            PairingMode::Handshake => self.end_session(SessionEndReason::Expired),
            PairingMode::Shuffle => self.rotate(now),
        }
    }

    pub fn on_transport_failed(&mut self) -> Vec<Action> {
        if !self.session.is_paired() {
            return Vec::new();
        }
        self.end_session(SessionEndReason::TransportFailed)
    }

    // MARK: - Shuffle mode

    /// End the current session (if any) and pair with the least-visited
    /// fresh peer.
    pub fn rotate(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = self.end_session(SessionEndReason::Expired);
        let candidates = self.peers.fresh_identities(now, self.config.peer_freshness);
        let Some(identity) = self.shuffle.pick_next(&candidates) else {
            debug!("[Pairing] no fresh peers to rotate to ({} known)", self.peers.len());
            return actions;
        };
        let Some(hostname) = self.peers.hostname_for(&identity).map(str::to_owned) else {
            return actions;
        };
        // Retargeting directly; drop the ClearTarget from the ended session.
        actions.retain(|a| !matches!(a, Action::ClearTarget));
        actions.extend(self.begin_session(&identity, &hostname, now, false));
        actions
    }
}

fn within(at: Option<&Instant>, now: Instant, window: Duration) -> bool {
    at.is_some_and(|t| now.saturating_duration_since(*t) < window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use swaplink_core::protocol::PairStatus;

    fn coordinator(local: &str) -> PairingCoordinator {
        PairingCoordinator::new(local, CoordinatorConfig::default())
    }

    fn shuffle_coordinator(local: &str) -> PairingCoordinator {
        let config = CoordinatorConfig { mode: PairingMode::Shuffle, ..CoordinatorConfig::default() };
        PairingCoordinator::new(local, config)
    }

    fn requests(actions: &[Action]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendPairRequest { hostname } => Some(hostname.as_str()),
                _ => None,
            })
            .collect()
    }

    fn timer_generation(actions: &[Action]) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            Action::ArmSessionTimer { generation, .. } => Some(*generation),
            _ => None,
        })
    }

    #[test]
    fn exactly_one_side_accepts_crossing_requests() {
        for (x, y) in [("id-a", "id-b"), ("node-9", "node-10"), ("b", "ab")] {
            let mut cx = coordinator(x);
            let mut cy = coordinator(y);
            let x_accepts_y = cx.handle_pair_request(y).status == PairStatus::Accepted;
            let y_accepts_x = cy.handle_pair_request(x).status == PairStatus::Accepted;
            assert!(x_accepts_y ^ y_accepts_x, "{x} vs {y}");
            // The accepting side is always the smaller identity.
            assert_eq!(x_accepts_y, x < y);
        }
    }

    #[test]
    fn crossing_requests_settle_on_one_session() {
        let now = Instant::now();
        let mut small = coordinator("id-a");
        let mut big = coordinator("id-z");
        assert_eq!(requests(&small.on_discovered("host-z", "id-z", now)), vec!["host-z"]);
        assert_eq!(requests(&big.on_discovered("host-a", "id-a", now)), vec!["host-a"]);

        // Each side answers the other's request.
        let to_small = small.handle_pair_request("id-z");
        let to_big = big.handle_pair_request("id-a");
        assert_eq!(to_small.status, PairStatus::Accepted);
        assert_eq!(to_big.reason.as_deref(), Some(reasons::TIE_BREAK));

        // big confirms, small pairs on receipt; small's own attempt loses.
        assert!(matches!(&big.on_pair_accepted("host-a", "id-a")[..], [Action::SendConfirm { .. }]));
        let (resp, _) = small.confirm_pairing("host-z", "id-z", now);
        assert_eq!(resp.status, PairStatus::Confirmed);
        big.on_confirm_acknowledged("host-a", now);
        let err = PairingError::Rejected { host: "host-z".into(), reason: reasons::TIE_BREAK.into() };
        assert!(small.on_request_failed("host-z", &err, now).is_empty());

        assert!(small.session().is_paired_to("id-z"));
        assert!(big.session().is_paired_to("id-a"));
    }

    #[test]
    fn tie_break_rejection_reason() {
        let mut c = coordinator("id-m");
        let resp = c.handle_pair_request("id-a");
        assert_eq!(resp.status, PairStatus::Rejected);
        assert_eq!(resp.reason.as_deref(), Some(reasons::TIE_BREAK));
        assert_eq!(c.handle_pair_request("id-m").status, PairStatus::Rejected);
    }

    #[test]
    fn repeated_discovery_sends_one_request() {
        let t0 = Instant::now();
        let mut c = coordinator("id-x");
        let first = c.on_discovered("peer-03", "id-c", t0);
        let second = c.on_discovered("peer-03", "id-c", t0 + Duration::from_secs(2));
        assert_eq!(requests(&first), vec!["peer-03"]);
        assert!(second.is_empty());
    }

    #[test]
    fn request_cooldown_survives_a_failed_attempt() {
        let t0 = Instant::now();
        let mut c = coordinator("id-x");
        c.on_discovered("peer-03", "id-c", t0);
        let err = PairingError::Timeout { host: "peer-03".into() };
        c.on_request_failed("peer-03", &err, t0 + Duration::from_secs(1));
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.on_discovered("peer-03", "id-c", t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(requests(&c.on_discovered("peer-03", "id-c", t0 + Duration::from_secs(11))), vec!["peer-03"]);
    }

    #[test]
    fn rejection_imposes_longer_cooldown() {
        let t0 = Instant::now();
        let mut c = coordinator("id-x");
        c.on_discovered("peer-04", "id-d", t0);
        let err = PairingError::Rejected { host: "peer-04".into(), reason: "already_paired".into() };
        c.on_request_failed("peer-04", &err, t0);
        assert!(c.on_discovered("peer-04", "id-d", t0 + Duration::from_secs(15)).is_empty());
        assert!(c.on_discovered("peer-04", "id-d", t0 + Duration::from_secs(29)).is_empty());
        assert_eq!(requests(&c.on_discovered("peer-04", "id-d", t0 + Duration::from_secs(31))).len(), 1);
    }

    #[test]
    fn requester_pairs_after_confirm_ack() {
        let now = Instant::now();
        let mut c = coordinator("id-x");
        c.on_discovered("peer-05", "id-e", now);
        let confirm = c.on_pair_accepted("peer-05", "id-e");
        assert!(matches!(&confirm[..], [Action::SendConfirm { hostname }] if hostname == "peer-05"));
        assert_eq!(c.state(), SessionState::Pairing);

        let actions = c.on_confirm_acknowledged("peer-05", now);
        assert!(c.session().is_paired_to("id-e"));
        assert!(actions.iter().any(|a| matches!(a, Action::SetTarget { hostname } if hostname == "peer-05")));
        assert!(actions.iter().any(|a| matches!(a, Action::PauseDiscovery)));
        assert!(actions.iter().any(|a| matches!(a, Action::Emit(NodeEvent::Paired { .. }))));
        assert_eq!(timer_generation(&actions), Some(c.generation()));
    }

    #[test]
    fn acceptance_from_wrong_identity_abandons_attempt() {
        let now = Instant::now();
        let mut c = coordinator("id-x");
        c.on_discovered("peer-05", "id-e", now);
        assert!(c.on_pair_accepted("peer-05", "id-f").is_empty());
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn stale_acceptance_is_ignored() {
        let mut c = coordinator("id-x");
        assert!(c.on_pair_accepted("peer-09", "id-q").is_empty());
        assert!(c.on_confirm_acknowledged("peer-09", Instant::now()).is_empty());
    }

    #[test]
    fn confirm_then_session_end_allows_immediate_rerequest() {
        let now = Instant::now();
        let mut c = coordinator("id-a");
        assert_eq!(c.handle_pair_request("id-g").status, PairStatus::Accepted);
        let (resp, actions) = c.confirm_pairing("peer-07", "id-g", now);
        assert_eq!(resp.status, PairStatus::Confirmed);
        assert!(c.session().is_paired_to("id-g"));
        assert!(actions.iter().any(|a| matches!(a, Action::SetTarget { hostname } if hostname == "peer-07")));

        let ended = c.end_session(SessionEndReason::Expired);
        assert!(ended.iter().any(|a| matches!(a, Action::ClearTarget)));
        assert!(ended.iter().any(|a| matches!(a, Action::ResumeDiscovery)));
        assert!(ended.iter().any(|a| matches!(
            a,
            Action::Emit(NodeEvent::SessionEnded { identity, reason: SessionEndReason::Expired }) if identity == "id-g"
        )));
        assert_eq!(c.state(), SessionState::Idle);

        let again = c.on_discovered("peer-07", "id-g", now + Duration::from_secs(1));
        assert_eq!(requests(&again), vec!["peer-07"]);
    }

    #[test]
    fn paired_node_refuses_other_partners() {
        let now = Instant::now();
        let mut c = coordinator("id-a");
        c.confirm_pairing("peer-02", "id-b", now);

        let resp = c.handle_pair_request("id-c");
        assert_eq!(resp.reason.as_deref(), Some(reasons::ALREADY_PAIRED));
        assert_eq!(c.handle_pair_request("id-b").status, PairStatus::Accepted);

        let (resp, actions) = c.confirm_pairing("peer-03", "id-c", now);
        assert_eq!(resp.status, PairStatus::Rejected);
        assert!(actions.is_empty());
        assert!(c.session().is_paired_to("id-b"));
    }

    #[test]
    fn reconfirmation_retargets_without_new_timer() {
        let now = Instant::now();
        let mut c = coordinator("id-a");
        c.confirm_pairing("10.0.0.8", "id-b", now);
        let gen = c.generation();

        let (resp, actions) = c.confirm_pairing("10.0.0.9", "id-b", now + Duration::from_secs(30));
        assert_eq!(resp.status, PairStatus::Confirmed);
        assert!(matches!(&actions[..], [Action::SetTarget { hostname }] if hostname == "10.0.0.9"));
        assert_eq!(c.generation(), gen);
        assert_eq!(c.session().started_at, Some(now));
    }

    #[test]
    fn verified_hostname_skips_loopback_names() {
        let now = Instant::now();
        let mut c = coordinator("id-a");
        c.on_discovered("swaplink-07.local", "id-g", now);
        c.on_discovered("localhost", "id-h", now);
        assert_eq!(c.verified_hostname("id-g"), Some("swaplink-07.local"));
        assert_eq!(c.verified_hostname("id-h"), None);
        assert_eq!(c.verified_hostname("id-q"), None);
    }

    #[test]
    fn stale_timer_is_ignored() {
        let now = Instant::now();
        let mut c = coordinator("id-a");
        let first = c.confirm_pairing("peer-02", "id-b", now).1;
        let old_gen = timer_generation(&first).unwrap();
        c.end_session(SessionEndReason::TransportFailed);
        c.confirm_pairing("peer-02", "id-b", now);

        assert!(c.on_session_timer(old_gen, now).is_empty());
        assert!(c.session().is_paired());
        let ended = c.on_session_timer(c.generation(), now);
        assert!(!ended.is_empty());
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn transport_failure_ends_session() {
        let now = Instant::now();
        let mut c = coordinator("id-a");
        assert!(c.on_transport_failed().is_empty());
        c.confirm_pairing("peer-02", "id-b", now);
        let actions = c.on_transport_failed();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(NodeEvent::SessionEnded { reason: SessionEndReason::TransportFailed, .. })
        )));
    }

    #[test]
    fn shuffle_mode_rotates_without_handshake() {
        let t0 = Instant::now();
        let mut c = shuffle_coordinator("me");
        let first = c.on_discovered("host-c", "c", t0);
        assert!(requests(&first).is_empty());
        assert!(c.session().is_paired_to("c"));
        assert!(!first.iter().any(|a| matches!(a, Action::PauseDiscovery)));

        c.on_discovered("host-a", "a", t0);
        c.on_discovered("host-b", "b", t0);

        let mut order = Vec::new();
        for _ in 0..3 {
            let actions = c.on_session_timer(c.generation(), t0 + Duration::from_secs(1));
            assert!(!actions.iter().any(|a| matches!(a, Action::ClearTarget)));
            order.push(c.session().partner_identity.clone().unwrap());
        }
        assert_eq!(order, vec!["a", "b", "a"]);
    }
}
