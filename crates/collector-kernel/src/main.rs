//! Collector Kernel - worker process entry point

use anyhow::{Context, Result};
use collector_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use collector_kernel::{
    collector::{lock::LockManager, HttpPipelineInvoker, ModuleCatalog},
    config::KernelConfig,
    db::{self, PgCollectorStore},
    kernel::{spawn_tenant_workers, KernelServices, KernelStores, WorkerSettings},
    storage::S3ObjectStore,
    worker::Supervisor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("collector-kernel")
        .filter_directives("collector_kernel=debug,collector_common=debug,sqlx=warn")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting collector kernel");

    let config = KernelConfig::load()?;
    info!(
        tenants = config.tenants.len(),
        modules_path = %config.modules_path.display(),
        "Configuration loaded"
    );

    let catalog = ModuleCatalog::load(&config.modules_path)?;
    info!(modules = catalog.modules.len(), "Module catalog loaded");

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgCollectorStore::new(pool));
    let pipeline = HttpPipelineInvoker::new(&config.pipeline)
        .context("Failed to build pipeline client")?;

    let locks = Arc::new(LockManager::new(store.clone()));
    info!(owner = %locks.owner(), "Worker identity");

    let services = KernelServices {
        stores: KernelStores::shared(store),
        objects: Arc::new(S3ObjectStore::new(config.storage.clone())),
        pipeline: Arc::new(pipeline),
        catalog: Arc::new(catalog),
        locks,
    };
    let settings = WorkerSettings::from(&config);

    let mut supervisor = Supervisor::new(config.max_backoff);
    spawn_tenant_workers(&mut supervisor, &config.tenants, &services, &settings).await;
    info!(workers = supervisor.len(), "Collector kernel running");

    shutdown_signal().await;

    for health in supervisor.health().await {
        info!(
            worker = %health.name,
            cycles = health.cycles,
            failures = health.failures,
            panics = health.panics,
            "Worker summary"
        );
    }
    supervisor.shutdown().await;

    info!("Collector kernel shut down gracefully");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
