//! Feed resilience service.
//!
//! ```text
//!   client ──▶ request id ─▶ trace ─▶ timeout ─▶ rate limit ─▶ /api handlers
//!                                                                   │
//!                                   breaker registry (readiness) ◀──┘
//!
//!   callers ─▶ ProtectedDependency (retry ─▶ circuit breaker ─▶ dependency)
//!              DependencyError ─▶ ApiError (503, Retry-After)
//!
//!   /health   /metrics (Prometheus text)   /admin/* (Bearer auth)
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use feed_resilience::config::watcher::ConfigWatcher;
use feed_resilience::config::{load_config, AdminConfig, ServiceConfig};
use feed_resilience::http::HttpServer;
use feed_resilience::lifecycle::{signals, Shutdown};
use feed_resilience::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "feed-resilience")]
#[command(about = "Resilience layer for the feed aggregation service", long_about = None)]
struct Args {
    /// Path to the TOML config file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload the config file when it changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };

    init_logging(&config.observability)?;
    tracing::info!("feed-resilience v{} starting", env!("CARGO_PKG_VERSION"));

    if config.admin.enabled && config.admin.api_key == AdminConfig::default().api_key {
        tracing::warn!("Admin surface enabled with the placeholder API key");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        rate_limit_enabled = config.rate_limit.enabled,
        base_limit = config.rate_limit.limiter.base_limit,
        breakers = config.breaker_configs().len(),
        "Configuration loaded"
    );

    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    // The watcher handle must outlive the server.
    let (_watcher, config_updates) = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            (Some(watcher.run()?), rx)
        }
        _ => {
            let (_tx, rx) = mpsc::unbounded_channel();
            (None, rx)
        }
    };

    let server = HttpServer::new(config);
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
