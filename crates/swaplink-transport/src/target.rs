//! Streaming target updates.
//!
//! Hostname resolution can take seconds, so it never runs on the transport
//! loop. Commands are processed one at a time by a single tokio task which
//! publishes the resolved address through a `watch` channel. The loop only
//! ever calls `borrow()` on its receiver.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCommand {
    /// Resolve `host` and stream to `host:port`.
    Set { host: String, port: u16 },
    /// Stream to an already-resolved address.
    SetAddr(SocketAddr),
    /// Stop sending.
    Clear,
}

/// Cheap, cloneable front end of the target updater task.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    commands: mpsc::UnboundedSender<TargetCommand>,
    current: watch::Receiver<Option<SocketAddr>>,
}

impl TargetHandle {
    pub fn set(&self, host: impl Into<String>, port: u16) {
        self.send(TargetCommand::Set { host: host.into(), port });
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        self.send(TargetCommand::SetAddr(addr));
    }

    pub fn clear(&self) {
        self.send(TargetCommand::Clear);
    }

    /// Address the loop is currently streaming to.
    pub fn current(&self) -> Option<SocketAddr> {
        *self.current.borrow()
    }

    /// Receiver for the transport loop.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.current.clone()
    }

    fn send(&self, cmd: TargetCommand) {
        if self.commands.send(cmd).is_err() {
            warn!("[Transport] target updater stopped; command ignored");
        }
    }
}

/// Spawn the updater on the current tokio runtime.
pub fn spawn_target_updater() -> TargetHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (target_tx, target_rx) = watch::channel(None);
    tokio::spawn(run_updater(rx, target_tx));
    TargetHandle { commands: tx, current: target_rx }
}

async fn run_updater(
    mut commands: mpsc::UnboundedReceiver<TargetCommand>,
    target: watch::Sender<Option<SocketAddr>>,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            TargetCommand::Set { host, port } => match resolve(&host, port).await {
                Some(addr) => {
                    info!("[Transport] target → {} ({})", host, addr);
                    target.send_replace(Some(addr));
                }
                None => {
                    warn!("[Transport] could not resolve {}:{}; target cleared", host, port);
                    target.send_replace(None);
                }
            },
            TargetCommand::SetAddr(addr) => {
                info!("[Transport] target → {}", addr);
                target.send_replace(Some(addr));
            }
            TargetCommand::Clear => {
                if target.send_replace(None).is_some() {
                    info!("[Transport] target cleared");
                }
            }
        }
    }
    debug!("[Transport] target updater exiting");
}

/// Resolve to a single address, preferring IPv4 (the video socket binds v4).
pub async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    let lookup = tokio::time::timeout(RESOLVE_TIMEOUT, lookup_host((host, port))).await;
    let addrs: Vec<SocketAddr> = match lookup {
        Ok(Ok(it)) => it.collect(),
        Ok(Err(e)) => {
            debug!("[Transport] lookup {} failed: {}", host, e);
            return None;
        }
        Err(_) => {
            debug!("[Transport] lookup {} timed out", host);
            return None;
        }
    };
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}
