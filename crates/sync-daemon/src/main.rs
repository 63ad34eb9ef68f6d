//! Aurum sync daemon
//!
//! Main entry point: keeps the product catalog priced against the live gold feed

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aurum_core::EngineConfig;
use aurum_engine::FeedHub;
use aurum_price_feed::{HttpRateSource, WsPushChannel};
use aurum_sync_daemon::{load_catalog, report::log_view};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting Aurum sync daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = env::var("AURUM_CONFIG").ok().map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;
    info!(
        feed = %config.feed.name,
        push = config.feed.push_url.as_deref().unwrap_or("none"),
        poll = %config.feed.poll_url,
        interval_secs = config.feed.poll_interval_secs,
        "Configuration loaded"
    );

    let catalog = match env::var("AURUM_CATALOG") {
        Ok(path) => load_catalog(&PathBuf::from(path))?,
        Err(_) => {
            info!("AURUM_CATALOG not set, tracking rates only");
            Vec::new()
        }
    };

    // Feed collaborators
    let push = WsPushChannel::new().with_subscribe_message(config.feed.subscribe_message.clone());
    let source = HttpRateSource::new(config.feed.request_timeout())?;

    let hub = FeedHub::new(Arc::new(push), Arc::new(source));
    let lease = hub.acquire(config).await?;
    lease.set_entities(catalog);
    let subscription = lease.subscribe(log_view);

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    subscription.unsubscribe();
    lease.release().await;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("AURUM_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}
