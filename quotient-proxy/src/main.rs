//! Quotient proxy binary.
//!
//! Wires the configuration store, backend pool, session server and
//! backfill controller together and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotient_backfill::{BackfillController, MySqlStore, WorkerSettings};
use quotient_proxy::pool::{BackendPool, PoolConfig};
use quotient_proxy::server::ProxyServer;
use quotient_shared::config::{ConfigStore, ProxyConfig};
use quotient_shared::metrics::{MetricsSink, NoopSink};

/// Transparent MySQL dual-write proxy for currency redenomination.
#[derive(Parser)]
#[command(name = "quotient-proxy", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "quotient.yaml")]
    config: PathBuf,

    /// Override the listener address from the config file.
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = ProxyConfig::load(&args.config)?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(level),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "quotient proxy starting"
    );
    info!(
        backend = %config.backend_addr(),
        ratio = config.conversion.ratio,
        precision = config.conversion.precision,
        rounding = config.conversion.rounding_mode.as_str(),
        tables = config.tables.len(),
        "configuration loaded"
    );

    let store = Arc::new(ConfigStore::new(config.snapshot())?);
    let metrics: Arc<dyn MetricsSink> = Arc::new(NoopSink);

    let pool = BackendPool::new(
        PoolConfig::from_settings(&config.backend),
        &config.circuit_breaker,
        Arc::clone(&metrics),
    );
    let reaper = pool.start_reaper();

    let controller = if config.backfill.enabled {
        let db = MySqlStore::connect(&config.backfill.database_url).await?;
        let controller = Arc::new(BackfillController::new(
            Arc::new(db),
            Arc::clone(&store),
            WorkerSettings::from_settings(&config.backfill),
            Arc::clone(&metrics),
        ));
        let snapshot = store.current();
        for (table, rule) in &snapshot.tables {
            if !rule.enabled {
                continue;
            }
            for column in rule.columns.keys() {
                if let Err(e) = controller.start(table, column).await {
                    warn!(table = %table, error = %e, "could not start backfill job");
                }
            }
        }
        Some(controller)
    } else {
        None
    };

    let listen_addr = args.bind.unwrap_or_else(|| config.listen_addr());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(
        &listen_addr,
        config.proxy.max_sessions,
        Arc::clone(&pool),
        Arc::clone(&store),
        Arc::clone(&metrics),
        shutdown_rx,
    )
    .await?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "proxy server terminated");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(controller) = controller {
        controller.stop_all().await;
    }
    reaper.abort();
    let _ = server_task.await;

    info!("shutdown complete");
    Ok(())
}
