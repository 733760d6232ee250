//! PeerDiscoveryScanner: three candidate producers, one verifier.
//!
//! ```text
//!  name scan (every 15 s) ──┐
//!  subnet sweep (60 s)    ──┼─► candidates ─► verifier ─► probe pool (4) ─► classify
//!  broadcast listener     ──┘                    ▲                            │
//!                                                └──── completions ◄──────────┘
//!                                                          │ Peer
//!                                                          ▼
//!                                                NodeEvent::Discovered
//! ```
//!
//! The scanner keeps no peer table of its own; the pairing side records
//! every `Discovered` peer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use swaplink_core::config::DiscoveryConfig;
use swaplink_core::errors::ProbeError;
use swaplink_core::protocol::IdentityInfo;
use swaplink_core::{EventSender, NodeEvent};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{run_announcer, run_listener, Announcement, ListenerContext};
use crate::candidates::name_candidates;
use crate::classify::{classify, Verdict};
use crate::probe::IdentityProber;
use crate::subnet::{detect_local_ipv4, sweep_candidates};
use crate::Candidate;

/// Slack on top of the prober's own timeout before a probe is abandoned.
const PROBE_GRACE: Duration = Duration::from_secs(1);

/// Who we are, as far as discovery cares.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub identity: String,
    pub marker: String,
    pub service_port: u16,
}

/// Cloneable pause / resume switch for a running scanner.
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    paused: Arc<watch::Sender<bool>>,
    rescan: Arc<Notify>,
}

impl DiscoveryHandle {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused: Arc::new(paused), rescan: Arc::new(Notify::new()) }
    }

    /// Stop producing candidates (and emitting peers) until [`resume`](Self::resume).
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("[Discovery] paused");
        }
    }

    /// Resume and rescan immediately.
    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("[Discovery] resumed");
        }
        self.rescan.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

pub struct PeerDiscoveryScanner {
    config: DiscoveryConfig,
    local: LocalNode,
    prober: Arc<dyn IdentityProber>,
    events: EventSender,
    control: DiscoveryHandle,
    candidates: mpsc::UnboundedSender<Candidate>,
    pending_rx: Option<mpsc::UnboundedReceiver<Candidate>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerDiscoveryScanner {
    pub fn new(
        config: DiscoveryConfig,
        local: LocalNode,
        prober: Arc<dyn IdentityProber>,
        events: EventSender,
    ) -> Self {
        let (candidates, pending_rx) = mpsc::unbounded_channel();
        Self {
            config,
            local,
            prober,
            events,
            control: DiscoveryHandle::new(),
            candidates,
            pending_rx: Some(pending_rx),
            tasks: Vec::new(),
        }
    }

    /// Spawn the producers and the verifier. A second call is a no-op.
    pub fn start(&mut self) {
        let Some(rx) = self.pending_rx.take() else {
            return;
        };

        let verifier = Verifier {
            local: self.local.clone(),
            prober: Arc::clone(&self.prober),
            events: self.events.clone(),
            paused: self.control.subscribe(),
            workers: self.config.probe_workers.max(1),
            timeout: self.config.probe_timeout() + PROBE_GRACE,
        };
        self.tasks.push(tokio::spawn(verifier.run(rx)));

        let cfg = self.config.clone();
        let port = self.local.service_port;
        self.spawn_periodic("name scan", self.config.name_scan_period(), move || {
            name_candidates(&cfg)
                .into_iter()
                .map(|host| Candidate::new(host, port))
                .collect()
        });

        if self.config.subnet_sweep_enabled {
            let limit = self.config.subnet_sweep_limit;
            self.spawn_periodic("subnet sweep", self.config.subnet_scan_period(), move || {
                match detect_local_ipv4() {
                    Some(local) => sweep_candidates(local, limit)
                        .into_iter()
                        .map(|ip| Candidate::new(ip.to_string(), port))
                        .collect(),
                    None => {
                        debug!("[Discovery] no LAN IPv4 address; subnet sweep skipped");
                        Vec::new()
                    }
                }
            });
        }

        if self.config.broadcast_enabled {
            self.spawn_broadcast();
        }

        info!(
            "[Discovery] started (identity={}, workers={}, sweep={}, broadcast={})",
            self.local.identity,
            self.config.probe_workers,
            self.config.subnet_sweep_enabled,
            self.config.broadcast_enabled
        );
    }

    pub fn handle(&self) -> DiscoveryHandle {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Queue one candidate for verification.
    pub fn submit(&self, candidate: Candidate) {
        let _ = self.candidates.send(candidate);
    }

    pub fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("[Discovery] stopped");
    }

    fn spawn_periodic<F>(&mut self, label: &'static str, period: Duration, produce: F)
    where
        F: Fn() -> Vec<Candidate> + Send + 'static,
    {
        let tx = self.candidates.clone();
        let paused = self.control.subscribe();
        let rescan = Arc::clone(&self.control.rescan);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rescan.notified() => {}
                }
                if *paused.borrow() {
                    continue;
                }
                let batch = produce();
                trace!("[Discovery] {}: {} candidates", label, batch.len());
                for candidate in batch {
                    if tx.send(candidate).is_err() {
                        return;
                    }
                }
            }
        }));
    }

    fn spawn_broadcast(&mut self) {
        let announcement = Announcement {
            marker: self.local.marker.clone(),
            identity: self.local.identity.clone(),
            service_port: self.local.service_port,
        };
        let port = self.config.broadcast_port;
        let interval = self.config.announce_interval();
        let paused = self.control.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = run_announcer(announcement, port, interval, paused).await {
                warn!("[Discovery] announcer disabled: {}", e);
            }
        }));

        let ctx = ListenerContext {
            marker: self.local.marker.clone(),
            local_identity: self.local.identity.clone(),
            dedupe_ttl: self.config.name_scan_period(),
            candidates: self.candidates.clone(),
            paused: self.control.subscribe(),
        };
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = run_listener(port, ctx).await {
                warn!("[Discovery] broadcast listener disabled: {}", e);
            }
        }));
    }
}

impl Drop for PeerDiscoveryScanner {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ── Verifier ──────────────────────────────────────────────────────────────────

type ProbeOutcome = (Candidate, Result<IdentityInfo, ProbeError>);

/// What has been logged at info level already.
#[derive(Default)]
struct Seen {
    self_hosts: HashSet<String>,
    peers: HashSet<String>,
}

struct Verifier {
    local: LocalNode,
    prober: Arc<dyn IdentityProber>,
    events: EventSender,
    paused: watch::Receiver<bool>,
    workers: usize,
    timeout: Duration,
}

impl Verifier {
    async fn run(self, mut candidates: mpsc::UnboundedReceiver<Candidate>) {
        let permits = Arc::new(Semaphore::new(self.workers));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ProbeOutcome>();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut seen = Seen::default();

        loop {
            tokio::select! {
                Some(candidate) = candidates.recv() => {
                    if !in_flight.insert(candidate.host.clone()) {
                        trace!("[Discovery] {} already being probed", candidate.host);
                        continue;
                    }
                    self.spawn_probe(candidate, Arc::clone(&permits), done_tx.clone());
                }
                Some((candidate, result)) = done_rx.recv() => {
                    in_flight.remove(&candidate.host);
                    self.handle(candidate, result, &mut seen);
                }
                else => break,
            }
        }
    }

    fn spawn_probe(&self, candidate: Candidate, permits: Arc<Semaphore>, done: mpsc::UnboundedSender<ProbeOutcome>) {
        let prober = Arc::clone(&self.prober);
        let marker = self.local.marker.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = match tokio::time::timeout(timeout, prober.probe(&candidate, &marker)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout { host: candidate.host.clone() }),
            };
            let _ = done.send((candidate, result));
        });
    }

    fn handle(&self, candidate: Candidate, result: Result<IdentityInfo, ProbeError>, seen: &mut Seen) {
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                debug!("[Discovery] {}", e);
                return;
            }
        };

        match classify(&candidate.host, &info, &self.local.identity) {
            Verdict::SelfIdentity => {
                if seen.self_hosts.insert(candidate.host.clone()) {
                    info!("[Discovery] {} is this node ({})", candidate.host, info.id);
                }
            }
            Verdict::Loopback => {
                debug!("[Discovery] discarding loopback candidate {}", candidate.host);
            }
            Verdict::Peer => {
                if seen.peers.insert(info.id.clone()) {
                    info!("[Discovery] found peer {} at {} ({})", info.id, candidate.host, info.device);
                } else {
                    debug!("[Discovery] refreshed peer {} at {}", info.id, candidate.host);
                }
                if *self.paused.borrow() {
                    return;
                }
                let _ = self.events.send(NodeEvent::Discovered {
                    hostname: candidate.host,
                    identity: info.id,
                });
            }
        }
    }
}
