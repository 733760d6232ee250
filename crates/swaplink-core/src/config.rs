//! Node configuration.
//!
//! Resolution order: built-in defaults → TOML file → environment overrides.
//!
//! File lookup (first existing wins):
//! 1. `$SWAPLINK_CONFIG` or the path given on the command line
//! 2. `~/.config/swaplink/config.toml`
//! 3. `/etc/swaplink/config.toml`
//!
//! Env overrides: `SWAPLINK_IDENTITY`, `SWAPLINK_SERVICE_PORT`,
//! `SWAPLINK_VIDEO_PORT`, `SWAPLINK_DISCOVERY_PORT`, `SWAPLINK_PAIRING_MODE`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::SwapLinkError;
use crate::protocol::{APP_MARKER, HEADER_SIZE};

// MARK: - NodeConfig

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub service: ServiceConfig,
    pub discovery: DiscoveryConfig,
    pub pairing: PairingConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable identity string. Generated at load time when absent.
    pub id: Option<String>,
    /// Human-readable device name reported by the identity probe.
    pub device_name: Option<String>,
    /// Application marker shared by every node of one deployment.
    pub marker: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: None,
            device_name: None,
            marker: APP_MARKER.to_owned(),
        }
    }
}

/// HTTP surface (identity probe + pairing endpoints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_owned(),
            port: 7879,
        }
    }
}

// MARK: - DiscoveryConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Hostname template; `{n}` is replaced by the zero-padded number.
    pub name_template: String,
    pub name_digits: usize,
    pub name_range_start: u32,
    pub name_range_end: u32,
    pub name_scan_period_secs: u64,
    pub subnet_sweep_enabled: bool,
    /// Max addresses probed per sweep.
    pub subnet_sweep_limit: usize,
    pub subnet_scan_period_secs: u64,
    pub broadcast_enabled: bool,
    pub broadcast_port: u16,
    pub announce_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_workers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_template: "swaplink-{n}.local".to_owned(),
            name_digits: 2,
            name_range_start: 1,
            name_range_end: 20,
            name_scan_period_secs: 15,
            subnet_sweep_enabled: true,
            subnet_sweep_limit: 64,
            subnet_scan_period_secs: 60,
            broadcast_enabled: true,
            broadcast_port: 7877,
            announce_interval_secs: 10,
            probe_timeout_secs: 5,
            probe_workers: 4,
        }
    }
}

impl DiscoveryConfig {
    pub fn name_scan_period(&self) -> Duration {
        Duration::from_secs(self.name_scan_period_secs)
    }

    pub fn subnet_scan_period(&self) -> Duration {
        Duration::from_secs(self.subnet_scan_period_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// MARK: - PairingConfig

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    /// Request / accept / confirm handshake with tie-break.
    Handshake,
    /// No handshake: rotate through verified peers with the shuffle selector.
    Shuffle,
}

impl std::str::FromStr for PairingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "handshake" => Ok(Self::Handshake),
            "shuffle" => Ok(Self::Shuffle),
            other => Err(format!("unknown pairing mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub mode: PairingMode,
    pub request_cooldown_secs: u64,
    pub rejection_cooldown_secs: u64,
    pub session_duration_secs: u64,
    /// Additional attempts after a timed-out request.
    pub request_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            mode: PairingMode::Handshake,
            request_cooldown_secs: 10,
            rejection_cooldown_secs: 30,
            session_duration_secs: 300,
            request_retries: 2,
            retry_delay_ms: 1_000,
            request_timeout_secs: 8,
        }
    }
}

impl PairingConfig {
    pub fn request_cooldown(&self) -> Duration {
        Duration::from_secs(self.request_cooldown_secs)
    }

    pub fn rejection_cooldown(&self) -> Duration {
        Duration::from_secs(self.rejection_cooldown_secs)
    }

    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session_duration_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// MARK: - TransportConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bind: String,
    pub port: u16,
    /// Full datagram size, header included.
    pub max_packet_size: usize,
    /// Frames needing more fragments than this are dropped.
    pub max_parts: u16,
    pub send_burst: usize,
    pub recv_burst: usize,
    pub recv_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    /// Fraction of parts required to finalize a frame (0.0, 1.0].
    pub completeness_threshold: f64,
    /// Frame ids further below the baseline than this mean the sender restarted.
    pub restart_window: u32,
    /// Forward jumps beyond this discard everything buffered.
    pub stale_window: u32,
    pub buffer_max_age_ms: u64,
    pub assembly_slots: usize,
    pub decode_workers: usize,
    /// Per-worker queue depth; frames beyond it are dropped.
    pub decode_queue: usize,
    pub max_consecutive_errors: u32,
    pub shutdown_timeout_ms: u64,
    pub restart_settle_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_owned(),
            port: 7878,
            max_packet_size: 1_200,
            max_parts: 200,
            send_burst: 30,
            recv_burst: 30,
            recv_timeout_ms: 1,
            idle_sleep_ms: 2,
            completeness_threshold: 1.0,
            restart_window: 50,
            stale_window: 1_000,
            buffer_max_age_ms: 500,
            assembly_slots: 5,
            decode_workers: 2,
            decode_queue: 4,
            max_consecutive_errors: 100,
            shutdown_timeout_ms: 1_000,
            restart_settle_ms: 250,
        }
    }
}

impl TransportConfig {
    /// Payload bytes carried by one datagram.
    pub fn max_payload(&self) -> usize {
        self.max_packet_size.saturating_sub(HEADER_SIZE)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.max(1))
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn buffer_max_age(&self) -> Duration {
        Duration::from_millis(self.buffer_max_age_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

// MARK: - Identity / validation

impl NodeConfig {
    /// Local identity. Call [`NodeConfig::ensure_identity`] first; falls back
    /// to an empty string only on an unprepared config.
    pub fn identity(&self) -> &str {
        self.identity.id.as_deref().unwrap_or_default()
    }

    /// Fill in a generated identity (`<hostname>-<8 hex>`) when none is set.
    pub fn ensure_identity(&mut self) -> &str {
        self.identity.id.get_or_insert_with(generate_identity)
    }

    pub fn device_name(&self) -> String {
        self.identity
            .device_name
            .clone()
            .unwrap_or_else(local_hostname)
    }

    pub fn validate(&self) -> Result<(), SwapLinkError> {
        let invalid = |reason: String| -> Result<(), SwapLinkError> {
            Err(SwapLinkError::ConfigurationInvalid { reason })
        };

        if self.identity.marker.is_empty() || self.identity.marker.contains(':') {
            return invalid("identity.marker must be non-empty and contain no ':'".into());
        }
        if let Some(id) = &self.identity.id {
            if id.trim().is_empty() {
                return invalid("identity.id must not be blank".into());
            }
        }
        let t = &self.transport;
        if t.max_payload() == 0 || t.max_packet_size > 65_507 {
            return invalid(format!(
                "transport.max_packet_size {} must be within {}..=65507",
                t.max_packet_size,
                HEADER_SIZE + 1
            ));
        }
        if !(t.completeness_threshold > 0.0 && t.completeness_threshold <= 1.0) {
            return invalid(format!(
                "transport.completeness_threshold {} must be in (0, 1]",
                t.completeness_threshold
            ));
        }
        if t.max_parts == 0 || t.assembly_slots == 0 || t.decode_workers == 0 || t.decode_queue == 0 {
            return invalid(
                "transport.max_parts, assembly_slots, decode_workers and decode_queue must be > 0"
                    .into(),
            );
        }
        if t.send_burst == 0 || t.recv_burst == 0 {
            return invalid("transport bursts must be > 0".into());
        }
        let d = &self.discovery;
        if d.probe_workers == 0 {
            return invalid("discovery.probe_workers must be > 0".into());
        }
        if d.name_range_start > d.name_range_end {
            return invalid(format!(
                "discovery name range {}..={} is empty",
                d.name_range_start, d.name_range_end
            ));
        }
        if !d.name_template.contains("{n}") {
            return invalid("discovery.name_template must contain '{n}'".into());
        }
        if self.pairing.session_duration_secs == 0 {
            return invalid("pairing.session_duration_secs must be > 0".into());
        }
        Ok(())
    }

    /// Apply `SWAPLINK_*` environment overrides on top of this config.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("SWAPLINK_IDENTITY") {
            if !id.trim().is_empty() {
                self.identity.id = Some(id.trim().to_owned());
            }
        }
        if let Some(p) = lookup("SWAPLINK_SERVICE_PORT").and_then(|s| s.parse().ok()) {
            self.service.port = p;
        }
        if let Some(p) = lookup("SWAPLINK_VIDEO_PORT").and_then(|s| s.parse().ok()) {
            self.transport.port = p;
        }
        if let Some(p) = lookup("SWAPLINK_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery.broadcast_port = p;
        }
        if let Some(mode) = lookup("SWAPLINK_PAIRING_MODE").and_then(|s| s.parse().ok()) {
            self.pairing.mode = mode;
        }
    }
}

// MARK: - Loading

/// Load config: defaults, then the first config file found, then env vars.
/// Always returns a validated config with an identity.
pub fn load(explicit: Option<&Path>) -> Result<NodeConfig, SwapLinkError> {
    let mut cfg = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => {
                debug!("No config file found, using defaults");
                NodeConfig::default()
            }
        },
    };
    cfg.apply_env();
    cfg.ensure_identity();
    cfg.validate()?;
    Ok(cfg)
}

fn read_file(path: &Path) -> Result<NodeConfig, SwapLinkError> {
    let file_err = |reason: String| SwapLinkError::ConfigurationFile {
        path: path.display().to_string(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
    let cfg = toml::from_str::<NodeConfig>(&text).map_err(|e| file_err(e.to_string()))?;
    info!("Loaded config from {}", path.display());
    Ok(cfg)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("SWAPLINK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME") {
        out.push(PathBuf::from(h).join(".config/swaplink/config.toml"));
    }
    out.push(PathBuf::from("/etc/swaplink/config.toml"));
    out
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "swaplink-node".to_owned())
}

fn generate_identity() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", local_hostname(), &suffix[..8])
}
