//! Broadcast announce / listen.
//!
//! Every node periodically sends `"<MARKER>:<identity>:<servicePort>"` to
//! `255.255.255.255:<discovery_port>`. Listeners turn the sender's address
//! into a probe candidate; the announcement itself is never trusted for the
//! identity, which is always confirmed by the probe.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::Candidate;

// ── Announcement ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub marker: String,
    pub identity: String,
    pub service_port: u16,
}

impl Announcement {
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.marker, self.identity, self.service_port)
    }

    /// Parse an announcement datagram. Identities may themselves contain
    /// `:`; the marker is the first field and the port the last.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?.trim();
        let (marker, rest) = text.split_once(':')?;
        let (identity, port) = rest.rsplit_once(':')?;
        if marker.is_empty() || identity.is_empty() {
            return None;
        }
        Some(Self {
            marker: marker.to_owned(),
            identity: identity.to_owned(),
            service_port: port.parse().ok()?,
        })
    }
}

// ── AddressDedupe ─────────────────────────────────────────────────────────────

/// Suppresses repeat announcements from one address for `ttl`.
#[derive(Debug)]
pub struct AddressDedupe {
    ttl: Duration,
    seen: HashMap<IpAddr, Instant>,
}

impl AddressDedupe {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, seen: HashMap::new() }
    }

    /// `true` when `ip` has not been admitted within the last `ttl`.
    pub fn admit(&mut self, ip: IpAddr, now: Instant) -> bool {
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
        if self.seen.contains_key(&ip) {
            return false;
        }
        self.seen.insert(ip, now);
        true
    }
}

// ── Sockets ───────────────────────────────────────────────────────────────────

fn broadcast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Send `announcement` every `interval` until the task is aborted.
/// Skips sending while `paused` is true.
pub async fn run_announcer(
    announcement: Announcement,
    discovery_port: u16,
    interval: Duration,
    paused: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = broadcast_socket(0)?;
    let dest = SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port));
    let payload = announcement.encode();
    info!("[Discovery] announcing '{}' to {}", payload, dest);

    let mut ticker = tokio::time::interval(interval);
    let mut failures: u32 = 0;
    loop {
        ticker.tick().await;
        if *paused.borrow() {
            continue;
        }
        match socket.send_to(payload.as_bytes(), dest).await {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % 30 == 0 {
                    warn!("[Discovery] announce failed ({}x): {}", failures, e);
                }
            }
        }
    }
}

pub struct ListenerContext {
    pub marker: String,
    pub local_identity: String,
    pub dedupe_ttl: Duration,
    pub candidates: mpsc::UnboundedSender<Candidate>,
    pub paused: watch::Receiver<bool>,
}

/// Bind the discovery port and forward announcing addresses as candidates.
pub async fn run_listener(discovery_port: u16, ctx: ListenerContext) -> std::io::Result<()> {
    let socket = broadcast_socket(discovery_port)?;
    info!("[Discovery] listening for announcements on UDP:{}", discovery_port);

    let mut dedupe = AddressDedupe::new(ctx.dedupe_ttl);
    let mut buf = vec![0u8; 512];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(ann) = Announcement::parse(&buf[..n]) else {
            trace!("[Discovery] ignoring {} bytes from {}", n, from);
            continue;
        };
        if ann.marker != ctx.marker || ann.identity == ctx.local_identity {
            continue;
        }
        if *ctx.paused.borrow() {
            continue;
        }
        if !dedupe.admit(from.ip(), Instant::now()) {
            continue;
        }
        debug!("[Discovery] announcement from {} ({})", from.ip(), ann.identity);
        let candidate = Candidate::new(from.ip().to_string(), ann.service_port);
        if ctx.candidates.send(candidate).is_err() {
            return Ok(());
        }
    }
}
