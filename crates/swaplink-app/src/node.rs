//! Node: the one service object that owns every subsystem.
//!
//! ```text
//!                 ┌──────────────── NodeEvent channel ────────────────┐
//!                 │                                                   ▼
//!  PeerDiscoveryScanner ──Discovered──►  event router ──► PairingService
//!        ▲  pause/resume                    │ TransportFailed     │ target
//!        └──────────────────────────────────┼─────────────────────┤
//!                                           ▼                     ▼
//!  HTTP service (identity, pairing, status)               FrameTransport
//! ```
//!
//! Lifecycle: [`Node::init`] builds everything stopped, [`Node::start`] binds
//! sockets and spawns tasks, [`Node::stop`] tears down in reverse. A node is
//! started at most once.
//!
//! A transport that fail-stops is restarted by a supervisor task, with a
//! backoff that doubles while restarts keep failing or keep dying young.
//! Restarts and stops block, so they run on the blocking pool.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use swaplink_core::protocol::IdentityInfo;
use swaplink_core::{
    event_channel, EventReceiver, EventSender, NodeConfig, NodeEvent, SessionSnapshot, TransportHealth,
};
use swaplink_discovery::{HttpProber, LocalNode, PeerDiscoveryScanner};
use swaplink_pairing::{
    CoordinatorConfig, HttpPairingClient, PairingCoordinator, PairingHandle, PairingService, RetryPolicy,
};
use swaplink_transport::{FrameSink, FrameTransport, JpegFrameDecoder, TransportStats};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::{ScannerControl, TransportTarget};
use crate::http::{self, HttpContext};

/// Received frames are logged once per this many.
const FRAME_LOG_EVERY: u64 = 300;

/// Peers not re-verified within this many name-scan periods drop out of
/// shuffle rotation.
const FRESHNESS_SCANS: u32 = 4;

/// First wait before restarting a failed transport.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// Ceiling for the restart backoff. A restart that survives this long resets it.
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

type SharedTransport = Arc<Mutex<FrameTransport>>;

fn lock(transport: &SharedTransport) -> MutexGuard<'_, FrameTransport> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub identity: String,
    pub device: String,
    pub session: SessionSnapshot,
    pub transport: TransportHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

pub struct Node {
    config: NodeConfig,
    identity: IdentityInfo,
    events: EventSender,
    events_rx: Option<EventReceiver>,
    transport: SharedTransport,
    /// Set once teardown begins; a queued restart must not revive the transport.
    stopping: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    sink: FrameSink,
    scanner: Option<PeerDiscoveryScanner>,
    pairing: Option<PairingHandle>,
    http_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    phase: Phase,
}

impl Node {
    /// Build every component, stopped. Must be called inside a tokio runtime.
    pub fn init(mut config: NodeConfig) -> Result<Self> {
        config.ensure_identity();
        config.validate().context("invalid configuration")?;

        let identity = IdentityInfo::ready(&config.identity.marker, &config.device_name(), config.identity());
        let (events, events_rx) = event_channel();
        let transport = FrameTransport::new(
            config.transport.clone(),
            Arc::new(JpegFrameDecoder),
            events.clone(),
        );

        let stats = transport.stats();
        let sink = transport.frame_sink();

        Ok(Self {
            config,
            identity,
            events,
            events_rx: Some(events_rx),
            transport: Arc::new(Mutex::new(transport)),
            stopping: Arc::new(AtomicBool::new(false)),
            stats,
            sink,
            scanner: None,
            pairing: None,
            http_addr: None,
            tasks: Vec::new(),
            phase: Phase::Created,
        })
    }

    /// Bind the HTTP service and the video socket, then start pairing,
    /// discovery and the event router. Bind failures are returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            bail!("node can only be started once");
        }

        let service = &self.config.service;
        let listener = TcpListener::bind((service.bind.as_str(), service.port))
            .await
            .with_context(|| format!("binding HTTP service on {}:{}", service.bind, service.port))?;
        let http_addr = listener.local_addr().context("reading HTTP service address")?;

        let (video_addr, target) = {
            let mut transport = lock(&self.transport);
            transport.start().context("starting frame transport")?;
            (transport.local_addr(), transport.target().clone())
        };

        let discovery = &self.config.discovery;
        let prober = HttpProber::new(discovery.probe_timeout()).context("building identity prober")?;
        let local = LocalNode {
            identity: self.identity.id.clone(),
            marker: self.config.identity.marker.clone(),
            service_port: http_addr.port(),
        };
        let mut scanner = PeerDiscoveryScanner::new(
            discovery.clone(),
            local,
            Arc::new(prober),
            self.events.clone(),
        );

        let pairing_cfg = &self.config.pairing;
        let client = HttpPairingClient::new(http_addr.port(), pairing_cfg.request_timeout())
            .context("building pairing client")?;
        let coordinator = PairingCoordinator::new(
            self.identity.id.clone(),
            CoordinatorConfig::new(pairing_cfg, discovery.name_scan_period() * FRESHNESS_SCANS),
        );
        let (pairing, pairing_task) = PairingService::spawn(
            coordinator,
            Arc::new(client),
            RetryPolicy::new(pairing_cfg.request_retries, pairing_cfg.retry_delay()),
            Arc::new(ScannerControl(scanner.handle())),
            Arc::new(TransportTarget {
                handle: target,
                video_port: self.config.transport.port,
            }),
            self.events.clone(),
        );
        self.tasks.push(pairing_task);

        let ctx = Arc::new(HttpContext {
            identity: self.identity.clone(),
            pairing: pairing.clone(),
            stats: Arc::clone(&self.stats),
        });
        self.tasks.push(tokio::spawn(http::serve(listener, ctx)));
        info!("[Node] HTTP service on {}", http_addr);

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(supervise_transport(
            Arc::clone(&self.transport),
            Arc::clone(&self.stopping),
            failures_rx,
        )));
        if let Some(rx) = self.events_rx.take() {
            self.tasks.push(tokio::spawn(route_events(rx, pairing.clone(), failures_tx)));
        }

        scanner.start();

        self.scanner = Some(scanner);
        self.pairing = Some(pairing);
        self.http_addr = Some(http_addr);
        self.phase = Phase::Running;
        info!(
            "[Node] {} running (video {:?}, mode {:?})",
            self.identity.id,
            video_addr,
            self.config.pairing.mode
        );
        Ok(())
    }

    /// End any session, stop discovery and the HTTP service, then the
    /// transport (bounded wait). Idempotent.
    pub async fn stop(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        self.stopping.store(true, Ordering::Release);
        if let Some(pairing) = &self.pairing {
            pairing.stop().await;
        }
        if let Some(mut scanner) = self.scanner.take() {
            scanner.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Waits out any restart still running on the blocking pool.
        let transport = Arc::clone(&self.transport);
        if let Err(e) = tokio::task::spawn_blocking(move || lock(&transport).stop()).await {
            warn!("[Node] transport stop task failed: {}", e);
        }
        self.phase = Phase::Stopped;
        info!("[Node] stopped");
    }

    pub async fn status(&self) -> NodeStatus {
        let session = match &self.pairing {
            Some(p) => p.status().await,
            None => SessionSnapshot::default(),
        };
        NodeStatus {
            identity: self.identity.id.clone(),
            device: self.identity.device.clone(),
            session,
            transport: self.stats.snapshot(),
        }
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn frame_sink(&self) -> FrameSink {
        self.sink.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.phase == Phase::Running {
            self.stopping.store(true, Ordering::Release);
            // Never block the runtime thread dropping us on the bounded join.
            let transport = Arc::clone(&self.transport);
            let spawned = std::thread::Builder::new()
                .name("swaplink-teardown".into())
                .spawn(move || lock(&transport).stop());
            if let Err(e) = spawned {
                warn!("[Node] could not spawn teardown thread: {}", e);
            }
        }
    }
}

/// Forward discovery results and transport failures to pairing; log the rest.
async fn route_events(mut rx: EventReceiver, pairing: PairingHandle, failures: mpsc::UnboundedSender<()>) {
    let mut frames: u64 = 0;
    while let Some(event) = rx.recv().await {
        match event {
            NodeEvent::Discovered { hostname, identity } => {
                info!("[Node] peer {} at {}", identity, hostname);
                pairing.discovered(&hostname, &identity);
            }
            NodeEvent::Paired { identity, hostname } => {
                info!("[Node] streaming to {} ({})", identity, hostname);
            }
            NodeEvent::SessionEnded { identity, reason } => {
                info!("[Node] session with {} ended: {}", identity, reason);
            }
            NodeEvent::FrameReady(frame) => {
                frames += 1;
                if frames % FRAME_LOG_EVERY == 1 {
                    info!(
                        "[Node] {} frames received (latest #{} {}x{}, {} bytes)",
                        frames,
                        frame.frame_id,
                        frame.width.unwrap_or(0),
                        frame.height.unwrap_or(0),
                        frame.data.len()
                    );
                }
            }
            NodeEvent::TransportFailed { reason } => {
                warn!("[Node] transport failed: {}", reason);
                pairing.transport_failed();
                let _ = failures.send(());
            }
        }
    }
}

/// Restart the transport after each fail-stop. The backoff doubles up to
/// [`RESTART_BACKOFF_MAX`] and resets once a restart has held that long.
async fn supervise_transport(
    transport: SharedTransport,
    stopping: Arc<AtomicBool>,
    mut failures: mpsc::UnboundedReceiver<()>,
) {
    let mut backoff = RESTART_BACKOFF;
    let mut last_restart: Option<Instant> = None;
    while failures.recv().await.is_some() {
        if last_restart.is_some_and(|at| at.elapsed() >= RESTART_BACKOFF_MAX) {
            backoff = RESTART_BACKOFF;
        }
        loop {
            info!("[Node] restarting transport in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);

            let t = Arc::clone(&transport);
            let stopping = Arc::clone(&stopping);
            let restarted = tokio::task::spawn_blocking(move || {
                let mut t = lock(&t);
                if stopping.load(Ordering::Acquire) {
                    return Ok(());
                }
                t.restart()
            });
            match restarted.await {
                Ok(Ok(())) => {
                    info!("[Node] transport restarted");
                    last_restart = Some(Instant::now());
                    break;
                }
                Ok(Err(e)) => warn!("[Node] transport restart failed: {}", e),
                Err(e) => {
                    warn!("[Node] transport restart task failed: {}", e);
                    return;
                }
            }
        }
        // Failures reported while restarting are already handled.
        while failures.try_recv().is_ok() {}
    }
}
