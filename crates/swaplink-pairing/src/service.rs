//! PairingService: runs a [`PairingCoordinator`] on a tokio task.
//!
//! ```text
//!  HTTP handlers ──┐                    ┌──► PairingClient (request / confirm)
//!  event router  ──┼─► command channel ─┤──► TargetControl (transport target)
//!  timers, calls ──┘        │           ├──► DiscoveryControl (pause / resume)
//!                    PairingCoordinator └──► EventSender (Paired, SessionEnded)
//! ```
//!
//! All coordinator state lives on one task, so every transition is
//! serialized. Outbound HTTP calls run one at a time on a worker task and,
//! like session timers, report back through the same command channel.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use swaplink_core::errors::PairingError;
use swaplink_core::protocol::{reasons, PairResponse};
use swaplink_core::{EventSender, SessionEndReason, SessionSnapshot};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::PairingClient;
use crate::coordinator::{Action, PairingCoordinator};
use crate::resolve::{resolve_partner, RESOLVE_TIMEOUT};
use crate::retry::RetryPolicy;

// ── Collaborator seams ────────────────────────────────────────────────────────

/// Pause and resume candidate scanning while a session runs.
pub trait DiscoveryControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Point the frame transport at the current partner.
pub trait TargetControl: Send + Sync {
    fn set_target(&self, hostname: &str);
    fn clear_target(&self);
}

// ── Commands ──────────────────────────────────────────────────────────────────

enum PairingCommand {
    Discovered { hostname: String, identity: String },
    PairRequest { requester_id: String, reply: oneshot::Sender<PairResponse> },
    VerifiedHostname { identity: String, reply: oneshot::Sender<Option<String>> },
    Confirm { host: String, peer_id: String, reply: oneshot::Sender<PairResponse> },
    TransportFailed,
    Status { reply: oneshot::Sender<SessionSnapshot> },
    Stop { reply: oneshot::Sender<()> },
    RequestDone { hostname: String, result: Result<String, PairingError> },
    ConfirmDone { hostname: String, result: Result<(), PairingError> },
    Timer { generation: u64 },
}

// ── PairingHandle ─────────────────────────────────────────────────────────────

/// Cheap, cloneable front door to a running [`PairingService`].
#[derive(Clone)]
pub struct PairingHandle {
    tx: mpsc::UnboundedSender<PairingCommand>,
}

impl PairingHandle {
    /// Feed a verified peer from discovery.
    pub fn discovered(&self, hostname: &str, identity: &str) {
        let _ = self.tx.send(PairingCommand::Discovered {
            hostname: hostname.to_owned(),
            identity: identity.to_owned(),
        });
    }

    /// Answer an incoming `/pair/request`.
    pub async fn pair_request(&self, requester_id: &str) -> PairResponse {
        let (reply, rx) = oneshot::channel();
        let cmd = PairingCommand::PairRequest { requester_id: requester_id.to_owned(), reply };
        self.ask(cmd, rx).await.unwrap_or_else(|| PairResponse::rejected(reasons::SHUTTING_DOWN))
    }

    /// Answer an incoming `/pair/confirm` from `addr`. The address is
    /// reverse-resolved off the service task before the coordinator sees it.
    pub async fn confirm(&self, addr: IpAddr, peer_id: &str) -> PairResponse {
        let (reply, rx) = oneshot::channel();
        let cmd = PairingCommand::VerifiedHostname { identity: peer_id.to_owned(), reply };
        let Some(verified) = self.ask(cmd, rx).await else {
            return PairResponse::rejected(reasons::SHUTTING_DOWN);
        };
        let host = resolve_partner(addr, verified.as_deref(), RESOLVE_TIMEOUT).await;

        let (reply, rx) = oneshot::channel();
        let cmd = PairingCommand::Confirm { host, peer_id: peer_id.to_owned(), reply };
        self.ask(cmd, rx).await.unwrap_or_else(|| PairResponse::rejected(reasons::SHUTTING_DOWN))
    }

    pub fn transport_failed(&self) {
        let _ = self.tx.send(PairingCommand::TransportFailed);
    }

    pub async fn status(&self) -> SessionSnapshot {
        let (reply, rx) = oneshot::channel();
        self.ask(PairingCommand::Status { reply }, rx).await.unwrap_or_default()
    }

    /// End any session and stop the service. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.ask(PairingCommand::Stop { reply }, rx).await;
    }

    async fn ask<T>(&self, cmd: PairingCommand, rx: oneshot::Receiver<T>) -> Option<T> {
        self.tx.send(cmd).ok()?;
        rx.await.ok()
    }
}

// ── PairingService ────────────────────────────────────────────────────────────

pub struct PairingService {
    coordinator: PairingCoordinator,
    outbound: mpsc::UnboundedSender<Outbound>,
    discovery: Arc<dyn DiscoveryControl>,
    target: Arc<dyn TargetControl>,
    events: EventSender,
    tx: mpsc::UnboundedSender<PairingCommand>,
    timer: Option<JoinHandle<()>>,
}

impl PairingService {
    /// Spawn the service task. Must be called inside a tokio runtime.
    pub fn spawn(
        coordinator: PairingCoordinator,
        client: Arc<dyn PairingClient>,
        retry: RetryPolicy,
        discovery: Arc<dyn DiscoveryControl>,
        target: Arc<dyn TargetControl>,
        events: EventSender,
    ) -> (PairingHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbound(client, retry, outbound_rx, tx.clone()));
        let service = Self {
            coordinator,
            outbound,
            discovery,
            target,
            events,
            tx: tx.clone(),
            timer: None,
        };
        let task = tokio::spawn(service.run(rx));
        (PairingHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PairingCommand>) {
        info!(
            "[Pairing] service started (identity {})",
            self.coordinator.local_identity()
        );
        while let Some(cmd) = rx.recv().await {
            let now = Instant::now();
            let actions = match cmd {
                PairingCommand::Discovered { hostname, identity } => {
                    self.coordinator.on_discovered(&hostname, &identity, now)
                }
                PairingCommand::PairRequest { requester_id, reply } => {
                    let _ = reply.send(self.coordinator.handle_pair_request(&requester_id));
                    Vec::new()
                }
                PairingCommand::VerifiedHostname { identity, reply } => {
                    let _ = reply.send(self.coordinator.verified_hostname(&identity).map(str::to_owned));
                    Vec::new()
                }
                PairingCommand::Confirm { host, peer_id, reply } => {
                    let (resp, actions) = self.coordinator.confirm_pairing(&host, &peer_id, now);
                    let _ = reply.send(resp);
                    actions
                }
                PairingCommand::TransportFailed => self.coordinator.on_transport_failed(),
                PairingCommand::Status { reply } => {
                    let _ = reply.send(self.coordinator.snapshot(now));
                    Vec::new()
                }
                PairingCommand::Stop { reply } => {
                    let actions = self.coordinator.end_session(SessionEndReason::Stopped);
                    self.perform(actions);
                    self.cancel_timer();
                    let _ = reply.send(());
                    break;
                }
                PairingCommand::RequestDone { hostname, result } => match result {
                    Ok(peer_id) => self.coordinator.on_pair_accepted(&hostname, &peer_id),
                    Err(e) => self.coordinator.on_request_failed(&hostname, &e, now),
                },
                PairingCommand::ConfirmDone { hostname, result } => match result {
                    Ok(()) => self.coordinator.on_confirm_acknowledged(&hostname, now),
                    Err(e) => self.coordinator.on_request_failed(&hostname, &e, now),
                },
                PairingCommand::Timer { generation } => {
                    self.coordinator.on_session_timer(generation, now)
                }
            };
            self.perform(actions);
        }
        self.cancel_timer();
        info!("[Pairing] service stopped");
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendPairRequest { hostname } => self.send_outbound(OutboundKind::Request, hostname),
                Action::SendConfirm { hostname } => self.send_outbound(OutboundKind::Confirm, hostname),
                Action::SetTarget { hostname } => self.target.set_target(&hostname),
                Action::ClearTarget => self.target.clear_target(),
                Action::ArmSessionTimer { generation, after } => {
                    self.cancel_timer();
                    let tx = self.tx.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(PairingCommand::Timer { generation });
                    }));
                }
                Action::PauseDiscovery => self.discovery.pause(),
                Action::ResumeDiscovery => self.discovery.resume(),
                Action::Emit(event) => {
                    if self.events.send(event).is_err() {
                        debug!("[Pairing] event receiver gone");
                    }
                }
            }
        }
    }

    fn send_outbound(&self, kind: OutboundKind, hostname: String) {
        let job = Outbound {
            kind,
            hostname,
            local_identity: self.coordinator.local_identity().to_owned(),
        };
        if self.outbound.send(job).is_err() {
            warn!("[Pairing] outbound worker gone");
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

// ── Outbound worker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum OutboundKind {
    Request,
    Confirm,
}

struct Outbound {
    kind: OutboundKind,
    hostname: String,
    local_identity: String,
}

/// Performs pairing calls one at a time, in order, and reports each outcome
/// back to the service. Exits when the service drops its sender.
async fn run_outbound(
    client: Arc<dyn PairingClient>,
    retry: RetryPolicy,
    mut jobs: mpsc::UnboundedReceiver<Outbound>,
    results: mpsc::UnboundedSender<PairingCommand>,
) {
    while let Some(Outbound { kind, hostname, local_identity }) = jobs.recv().await {
        let done = match kind {
            OutboundKind::Request => {
                let result = retry.run(|| client.request(&hostname, &local_identity)).await;
                if let Err(e) = &result {
                    log_failure("request", &hostname, e);
                }
                PairingCommand::RequestDone { hostname, result }
            }
            OutboundKind::Confirm => {
                let result = retry.run(|| client.confirm(&hostname, &local_identity)).await;
                if let Err(e) = &result {
                    log_failure("confirm", &hostname, e);
                }
                PairingCommand::ConfirmDone { hostname, result }
            }
        };
        if results.send(done).is_err() {
            return;
        }
    }
}

fn log_failure(call: &str, hostname: &str, e: &PairingError) {
    match e {
        PairingError::Rejected { .. } | PairingError::Malformed { .. } => {
            warn!("[Pairing] {} to {} failed: {}", call, hostname, e)
        }
        PairingError::Timeout { .. } | PairingError::Unreachable { .. } => {
            debug!("[Pairing] {} to {} failed: {}", call, hostname, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use swaplink_core::config::PairingMode;
    use swaplink_core::protocol::PairStatus;
    use swaplink_core::{event_channel, EventReceiver, NodeEvent, SessionState};

    // MARK: - Fakes

    struct FakeClient {
        peer_id: String,
        requests: AtomicU32,
        reject: bool,
    }

    impl FakeClient {
        fn accepting(peer_id: &str) -> Arc<Self> {
            Arc::new(Self { peer_id: peer_id.into(), requests: AtomicU32::new(0), reject: false })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self { peer_id: String::new(), requests: AtomicU32::new(0), reject: true })
        }
    }

    #[async_trait]
    impl PairingClient for FakeClient {
        async fn request(&self, hostname: &str, _local: &str) -> Result<String, PairingError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(PairingError::Rejected {
                    host: hostname.into(),
                    reason: reasons::ALREADY_PAIRED.into(),
                });
            }
            Ok(self.peer_id.clone())
        }

        async fn confirm(&self, _hostname: &str, _local: &str) -> Result<(), PairingError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDiscovery {
        paused: AtomicBool,
    }

    impl DiscoveryControl for FakeDiscovery {
        fn pause(&self) {
            self.paused.store(true, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.paused.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeTarget {
        current: Mutex<Option<String>>,
    }

    impl TargetControl for FakeTarget {
        fn set_target(&self, hostname: &str) {
            *self.current.lock().unwrap() = Some(hostname.to_owned());
        }
        fn clear_target(&self) {
            *self.current.lock().unwrap() = None;
        }
    }

    struct Harness {
        handle: PairingHandle,
        events: EventReceiver,
        discovery: Arc<FakeDiscovery>,
        target: Arc<FakeTarget>,
    }

    fn harness(local: &str, mode: PairingMode, client: Arc<dyn PairingClient>) -> Harness {
        let config = CoordinatorConfig {
            mode,
            session_duration: Duration::from_secs(300),
            ..CoordinatorConfig::default()
        };
        let (events_tx, events) = event_channel();
        let discovery = Arc::new(FakeDiscovery::default());
        let target = Arc::new(FakeTarget::default());
        let (handle, _task) = PairingService::spawn(
            PairingCoordinator::new(local, config),
            client,
            RetryPolicy::new(0, Duration::from_millis(10)),
            discovery.clone(),
            target.clone(),
            events_tx,
        );
        Harness { handle, events, discovery, target }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn target_of(h: &Harness) -> Option<String> {
        h.target.current.lock().unwrap().clone()
    }

    // MARK: - Tests

    #[tokio::test(start_paused = true)]
    async fn handshake_pairs_then_expires() {
        let mut h = harness("id-x", PairingMode::Handshake, FakeClient::accepting("id-c"));
        h.handle.discovered("peer-03", "id-c");

        match h.events.recv().await {
            Some(NodeEvent::Paired { identity, hostname }) => {
                assert_eq!(identity, "id-c");
                assert_eq!(hostname, "peer-03");
            }
            other => panic!("expected Paired, got {other:?}"),
        }
        assert_eq!(target_of(&h).as_deref(), Some("peer-03"));
        assert!(h.discovery.paused.load(Ordering::SeqCst));
        assert_eq!(h.handle.status().await.state, SessionState::Paired);

        // Paused clock auto-advances to the session timer.
        match h.events.recv().await {
            Some(NodeEvent::SessionEnded { identity, reason }) => {
                assert_eq!(identity, "id-c");
                assert_eq!(reason, SessionEndReason::Expired);
            }
            other => panic!("expected SessionEnded, got {other:?}"),
        }
        assert_eq!(target_of(&h), None);
        assert!(!h.discovery.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn acceptor_side_answers_over_handle() {
        let h = harness("id-a", PairingMode::Handshake, FakeClient::accepting("unused"));
        assert_eq!(h.handle.pair_request("id-b").await.status, PairStatus::Accepted);
        assert_eq!(h.handle.pair_request("id-0").await.reason.as_deref(), Some(reasons::TIE_BREAK));

        let resp = h.handle.confirm(ip("10.0.0.2"), "id-b").await;
        assert_eq!(resp.status, PairStatus::Confirmed);
        assert_eq!(target_of(&h).as_deref(), Some("10.0.0.2"));
        assert!(h.discovery.paused.load(Ordering::SeqCst));

        let resp = h.handle.confirm(ip("10.0.0.3"), "id-c").await;
        assert_eq!(resp.reason.as_deref(), Some(reasons::ALREADY_PAIRED));
    }

    #[tokio::test]
    async fn transport_failure_ends_session() {
        let mut h = harness("id-a", PairingMode::Handshake, FakeClient::accepting("unused"));
        h.handle.confirm(ip("10.0.0.2"), "id-b").await;
        assert!(matches!(h.events.recv().await, Some(NodeEvent::Paired { .. })));

        h.handle.transport_failed();
        assert!(matches!(
            h.events.recv().await,
            Some(NodeEvent::SessionEnded { reason: SessionEndReason::TransportFailed, .. })
        ));
        assert_eq!(h.handle.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn rejection_returns_to_idle_and_cools_down() {
        let client = FakeClient::rejecting();
        let h = harness("id-x", PairingMode::Handshake, client.clone());
        h.handle.discovered("peer-04", "id-d");
        // Status round-trips through the queue, after the request completes.
        for _ in 0..50 {
            if client.requests.load(Ordering::SeqCst) == 1
                && h.handle.status().await.state == SessionState::Idle
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.handle.status().await.state, SessionState::Idle);

        h.handle.discovered("peer-04", "id-d");
        assert_eq!(h.handle.status().await.state, SessionState::Idle);
        assert_eq!(client.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_ends_session_and_later_calls_degrade() {
        let mut h = harness("id-a", PairingMode::Handshake, FakeClient::accepting("unused"));
        h.handle.confirm(ip("10.0.0.2"), "id-b").await;
        h.events.recv().await;

        h.handle.stop().await;
        assert!(matches!(
            h.events.recv().await,
            Some(NodeEvent::SessionEnded { reason: SessionEndReason::Stopped, .. })
        ));
        assert_eq!(target_of(&h), None);

        let resp = h.handle.pair_request("id-z").await;
        assert_eq!(resp.reason.as_deref(), Some(reasons::SHUTTING_DOWN));
        assert_eq!(h.handle.status().await.state, SessionState::Idle);
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shuffle_mode_never_calls_the_client() {
        let client = FakeClient::accepting("unused");
        let mut h = harness("me", PairingMode::Shuffle, client.clone());
        h.handle.discovered("host-b", "b");
        assert!(matches!(h.events.recv().await, Some(NodeEvent::Paired { identity, .. }) if identity == "b"));
        assert_eq!(target_of(&h).as_deref(), Some("host-b"));
        assert!(!h.discovery.paused.load(Ordering::SeqCst));
        assert_eq!(client.requests.load(Ordering::SeqCst), 0);
    }
}
