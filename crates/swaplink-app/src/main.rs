use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod control;
mod http;
mod node;
mod source;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args = match app::Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("swaplink: {e}");
            eprintln!("usage: swaplink [--config <path>] [--synthetic-fps <n>] [--version]");
            std::process::exit(2);
        }
    };
    if args.version {
        println!("swaplink {}", VERSION);
        return Ok(());
    }

    // RUST_LOG=debug for per-probe and per-handshake detail
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("SwapLink v{}", VERSION);

    match app::run(args).await {
        Ok(()) => {
            info!("SwapLink exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
