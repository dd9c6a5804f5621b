use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use worker_supervisor::config::SupervisorConfig;
use worker_supervisor::error::SupervisorError;
use worker_supervisor::logging;
use worker_supervisor::store::LibSqlBackend;
use worker_supervisor::worker::{Supervisor, spawn_supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SupervisorConfig::from_env().context("invalid supervisor configuration")?;

    let _log_guard = logging::init_logging(config.log_dir.as_deref())
        .context("failed to initialize logging")?;

    eprintln!("Worker supervisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Worker: {} {}", config.worker.program, config.worker.args.join(" "));
    eprintln!("   Consumer: {}", config.consumer_id);
    eprintln!(
        "   Poll every {}s, cancel check every {}s\n",
        config.poll_interval.as_secs(),
        config.cancel_check_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let backend = match open_backend(&config).await {
        Ok(backend) => Arc::new(backend),
        Err(e) => return Err(startup_failed(e)),
    };

    if let Err(e) = backend
        .release_stale_claims()
        .await
        .map_err(SupervisorError::ClaimRecovery)
    {
        if e.is_fatal() {
            return Err(startup_failed(e));
        }
        warn!(error = %e, "Continuing with stale claims in place");
    }

    // ── Supervisor ───────────────────────────────────────────────────────
    let supervisor = Arc::new(Supervisor::new(backend.clone(), backend, &config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested, finishing current task");
        let _ = shutdown_tx.send(true);
    });

    spawn_supervisor(supervisor, shutdown_rx)
        .await
        .context("supervisor loop panicked")?;

    Ok(())
}

fn startup_failed(e: SupervisorError) -> anyhow::Error {
    error!(error = %e, fatal = e.is_fatal(), "Startup failed");
    e.into()
}

/// Open the task database. Failure here is fatal.
async fn open_backend(config: &SupervisorConfig) -> Result<LibSqlBackend, SupervisorError> {
    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .map_err(|e| {
            SupervisorError::Initialization(format!(
                "failed to open database at {}: {e}",
                config.db_path.display()
            ))
        })?
        .with_consumer_id(config.consumer_id.clone());

    backend
        .ping()
        .await
        .map_err(|e| SupervisorError::Initialization(format!("database not reachable: {e}")))?;

    Ok(backend)
}
