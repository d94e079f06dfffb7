//! scanbay-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Load the tool and playbook catalogs.
//! 5. Start the worker loop (recovery first, then polling).
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.
//! 7. Stop the worker once the job it is running, if any, has finished.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use scanbay_core::{PlaybookCatalog, Runtime, SqliteStore, ToolCatalog};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SCANBAY_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "scanbay-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database_url))?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Catalogs ────────────────────────────────────────────────────────────
    let tools_path = cfg.tools_path();
    let tools = ToolCatalog::load(&tools_path)
        .with_context(|| format!("failed to load tool catalog {}", tools_path.display()))?;
    let playbooks_path = cfg.playbooks_path();
    let playbooks = if playbooks_path.exists() {
        PlaybookCatalog::load(&playbooks_path)?
    } else {
        warn!(path = %playbooks_path.display(), "playbook catalog not found; no playbooks available");
        PlaybookCatalog::default()
    };
    info!(tools = tools.len(), playbooks = playbooks.all().len(), "catalogs loaded");

    tokio::fs::create_dir_all(&cfg.output_dir)
        .await
        .with_context(|| format!("failed to create output dir {}", cfg.output_dir.display()))?;
    let runtime = Runtime::new(
        Arc::new(store),
        Arc::new(tools),
        Arc::new(playbooks),
        cfg.output_dir.clone(),
    );

    // ── 5. Worker loop ─────────────────────────────────────────────────────────
    let worker = runtime.worker(cfg.poll_interval);
    let worker_state = worker.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = tokio::spawn(worker.run(shutdown_rx));

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        runtime,
        worker_state,
    });
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 7. Worker shutdown ─────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(cfg.shutdown_grace, &mut worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "worker task ended abnormally"),
        Err(_) => {
            warn!(
                grace_secs = cfg.shutdown_grace.as_secs(),
                "worker did not stop in time; the running job will be re-queued at next startup"
            );
            worker_handle.abort();
        }
    }

    info!("scanbay-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
