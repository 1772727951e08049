//! Resource Optimizer - cost policy controller
//!
//! Periodically scans the region named by each cost policy for orphaned
//! volumes, idle instances and untagged resources, and publishes the findings
//! as policy status.

use anyhow::{Context, Result};
use clap::Parser;
use optimizer_lib::{
    health::{components, HealthRegistry},
    scanner::{FileInventory, InventoryScannerFactory},
    store::load_policies,
    InMemoryPolicyStore, Reconciler, Scheduler, StructuredLogger,
};
use resource_optimizer::{api, config::ControllerConfig};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cost policy controller
#[derive(Parser)]
#[command(name = "resource-optimizer")]
#[command(author, version, long_about = None)]
#[command(about = "Reconciles cost policies against cloud resources")]
struct Cli {
    /// JSON file with policy manifests (overrides OPTIMIZER_POLICIES_PATH)
    #[arg(long)]
    policies: Option<PathBuf>,

    /// JSON file with the resource inventory (overrides OPTIMIZER_INVENTORY_PATH)
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Reconcile every policy once, print the statuses and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let mut config = ControllerConfig::load()?;
    if cli.policies.is_some() {
        config.policies_path = cli.policies;
    }
    if cli.inventory.is_some() {
        config.inventory_path = cli.inventory;
    }
    info!(instance = %config.instance_name, workers = config.workers, "Controller configured");

    let store = Arc::new(InMemoryPolicyStore::new());
    if let Some(path) = &config.policies_path {
        load_policies(&store, path).await?;
    } else {
        warn!("No policies file configured, starting with an empty policy store");
    }

    let inventory = match &config.inventory_path {
        Some(path) => FileInventory::load(path).await?,
        None => {
            warn!("No inventory configured, every scanner connection will fail");
            FileInventory::default()
        }
    };
    let scanners = Arc::new(InventoryScannerFactory::new(Arc::new(inventory)));

    let logger = StructuredLogger::new(&config.instance_name);
    let reconciler = Arc::new(
        Reconciler::new(store.clone(), scanners, config.reconcile_config())
            .with_logger(logger.clone()),
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::POLICY_STORE).await;

    let scheduler = Scheduler::new(reconciler, config.scheduler_config())
        .with_health(health_registry.clone());

    if cli.once {
        return run_once(&scheduler, &store).await;
    }

    logger.log_startup(CONTROLLER_VERSION, store.len());

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler_handle = tokio::spawn(scheduler.run(store.subscribe(), shutdown_rx));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    scheduler_handle.await.context("Scheduler task failed")?;
    api_handle.abort();

    info!("Shutting down");
    Ok(())
}

/// Reconcile every policy once and print the resulting statuses as JSON
async fn run_once(scheduler: &Scheduler, store: &InMemoryPolicyStore) -> Result<()> {
    let results = scheduler.run_once().await?;

    let report: Vec<_> = results
        .iter()
        .map(|(id, result)| {
            json!({
                "id": id,
                "status": store.status(id),
                "error": result.as_ref().err().map(|e| e.to_string()),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
