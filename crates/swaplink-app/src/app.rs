use std::path::PathBuf;

use anyhow::{Context, Result};
use swaplink_core::config;
use tracing::{info, warn};

use crate::node::Node;
use crate::source::SyntheticSource;

// ── Command line ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub version: bool,
    pub config: Option<PathBuf>,
    /// Frames per second of the built-in test pattern; 0 disables it.
    pub synthetic_fps: u32,
}

impl Args {
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut out = Args::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--version" | "-V" => out.version = true,
                "--config" | "-c" => {
                    let path = args.next().ok_or("--config needs a path")?;
                    out.config = Some(PathBuf::from(path));
                }
                "--synthetic-fps" => {
                    let n = args.next().ok_or("--synthetic-fps needs a number")?;
                    out.synthetic_fps = n
                        .parse()
                        .map_err(|_| format!("invalid --synthetic-fps '{n}'"))?;
                }
                other => return Err(format!("unknown argument '{other}'")),
            }
        }
        Ok(out)
    }
}

// ── Main flow ─────────────────────────────────────────────────────────────────

/// Load config, bring the node up, feed it frames until a shutdown signal.
pub async fn run(args: Args) -> Result<()> {
    let cfg = config::load(args.config.as_deref()).context("loading configuration")?;
    info!(
        "Identity {} ({}), pairing mode {:?}",
        cfg.identity(),
        cfg.device_name(),
        cfg.pairing.mode
    );

    let mut node = Node::init(cfg).context("initialising node")?;
    node.start().await.context("starting node")?;
    if let Some(addr) = node.http_addr() {
        info!("Identity probe: http://{}/identity", addr);
    }

    let source = if args.synthetic_fps > 0 {
        info!("Synthetic test pattern at {} fps", args.synthetic_fps);
        Some(SyntheticSource::spawn(node.frame_sink(), args.synthetic_fps))
    } else {
        info!("No frame source configured; receiving only");
        None
    };

    shutdown_signal().await.context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    if let Some(source) = source {
        source.stop();
    }
    node.stop().await;

    let status = node.status().await;
    info!(
        "Final counters: sent={} assembled={} decoded={} invalid={}",
        status.transport.frames_sent,
        status.transport.frames_assembled,
        status.transport.frames_decoded,
        status.transport.packets_invalid
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                return tokio::signal::ctrl_c().await;
            }
        };
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> Result<Args, String> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_all_flags() {
        let args = parse(&["--config", "/tmp/a.toml", "--synthetic-fps", "15"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/a.toml")));
        assert_eq!(args.synthetic_fps, 15);
        assert!(!args.version);
        assert!(parse(&["-V"]).unwrap().version);
        assert_eq!(parse(&[]).unwrap(), Args::default());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--synthetic-fps", "fast"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
    }
}
