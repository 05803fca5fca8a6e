//! cirrus-services: service manager daemon.
//!
//! Runs the reconciliation controller for service classes, instances and
//! bindings of the configured organizations against the in-process broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cirrus_controller::ControllerConfig;
use cirrus_services::{MemoryBroker, OrphanPolicy, new_controller};
use cirrus_store::{BackendConfig, BackendKind, EntityStore};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// cirrus service manager
#[derive(Parser, Debug)]
#[command(name = "cirrus-services", version, about)]
struct Args {
    /// Storage backend (memory, sqlite, postgres)
    #[arg(long, default_value = "sqlite")]
    database_backend: BackendKind,

    /// Database file (sqlite) or host[:port] (postgres)
    #[arg(long, default_value = cirrus_store::config::DEFAULT_ADDRESS)]
    database_address: String,

    /// Database name (postgres only)
    #[arg(long, default_value = cirrus_store::config::DEFAULT_BUCKET)]
    database_bucket: String,

    #[arg(long, default_value = cirrus_store::config::DEFAULT_USERNAME)]
    database_username: String,

    #[arg(long, default_value = cirrus_store::config::DEFAULT_PASSWORD)]
    database_password: String,

    /// Organization to reconcile (repeatable)
    #[arg(long = "organization", required = true)]
    organizations: Vec<String>,

    /// Seconds between resync passes
    #[arg(long, default_value = "10")]
    resync_period: u64,

    /// Number of concurrent workers
    #[arg(long, default_value = "10")]
    workers: usize,

    /// Service catalog offered by the in-process broker (JSON array)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Take over broker objects that have no stored entity
    #[arg(long)]
    import_orphans: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cirrus_services=info,cirrus_controller=info,cirrus_store=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting cirrus-services");
    info!("Organizations: {}", args.organizations.join(", "));

    let store = EntityStore::open(&BackendConfig {
        backend: args.database_backend,
        address: args.database_address,
        bucket: args.database_bucket,
        username: args.database_username,
        password: args.database_password,
    })
    .await
    .context("failed to open entity store")?;
    info!("Entity store: {}", store.backend_name());

    let broker = match &args.catalog {
        Some(path) => MemoryBroker::from_catalog_file(path)?,
        None => {
            warn!("No catalog given, the broker offers no services");
            MemoryBroker::new(Vec::new())
        }
    };

    let orphans = if args.import_orphans {
        OrphanPolicy::Import
    } else {
        OrphanPolicy::Ignore
    };

    let config = ControllerConfig {
        resync_period: Duration::from_secs(args.resync_period),
        workers: args.workers,
        ..ControllerConfig::for_organizations(args.organizations)
    };
    let (mut controller, _api) = new_controller(config, store, Arc::new(broker), orphans)?;
    controller.start().await?;

    // Wait for shutdown signal
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    controller.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
