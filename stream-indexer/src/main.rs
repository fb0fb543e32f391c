//! Stream Indexer Main Entry Point
//!
//! Consumes index messages from Kafka and indexes them into OpenSearch until
//! interrupted.

use dotenv::dotenv;
use std::env;
use stream_indexer::config::ConfigProvider;
use stream_indexer::{Dependencies, DynamicConfig, IndexerConfig, IndexerError};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("stream_indexer=info,stream_indexer_repository=info")
    });

    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .init();
    }

    info!(
        service_name = "stream-indexer",
        service_version = env!("CARGO_PKG_VERSION"),
        json = json,
        "Tracing initialized"
    );
}

/// Re-read `.env` and the environment, and apply the settings if they are
/// valid.
fn reload_config(config: &DynamicConfig) {
    if let Ok(vars) = dotenv::dotenv_iter() {
        for (key, value) in vars.flatten() {
            env::set_var(key, value);
        }
    }

    match config.reload(IndexerConfig::from_env()) {
        Ok(()) => info!(config = ?config.current(), "Configuration reloaded"),
        Err(e) => warn!(error = %e, "Rejected configuration reload, keeping current settings"),
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Wait for ctrl-c, reloading the configuration on every SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(config: &DynamicConfig) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGHUP, configuration reload disabled");
            return wait_for_ctrl_c().await;
        }
    };

    loop {
        tokio::select! {
            _ = wait_for_ctrl_c() => return,
            _ = hangup.recv() => reload_config(config),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config: &DynamicConfig) {
    wait_for_ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<(), IndexerError> {
    dotenv().ok();
    init_tracing();

    info!("Starting stream indexer");

    let deps = match Dependencies::new().await {
        Ok(deps) => {
            info!("Dependencies initialized successfully");
            deps
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize dependencies");
            return Err(e);
        }
    };

    let Dependencies { indexer, config } = deps;
    indexer.start().await?;

    wait_for_shutdown(&config).await;
    info!("Received shutdown signal");

    match indexer.stop().await {
        Ok(()) => {
            info!(health = ?indexer.health(), "Stream indexer stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Stream indexer stopped with errors");
            Err(e)
        }
    }
}
