//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use scanbay_core::{Runtime, WorkerState};
use tokio::sync::watch;

use crate::config::Config;

/// State shared across all HTTP handlers.
///
/// Handlers only touch the store through the runtime's components; the
/// worker loop runs elsewhere and is observed through `worker_state`.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    pub runtime: Runtime,
    /// Latest state published by the worker loop.
    pub worker_state: watch::Receiver<WorkerState>,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::time::Duration;

    use scanbay_core::{PlaybookCatalog, SqliteStore, ToolCatalog};

    use super::*;

    pub const TOOLS: &str = r#"{
        "nmap": {"name": "Nmap", "command": ["nmap", "{options}", "{target}"], "default_options": "-sV"},
        "curl": {"name": "cURL", "command": ["curl", "{options}", "{target}"], "default_options": "-sI"}
    }"#;

    pub const PLAYBOOKS: &str = r#"{"PLAYBOOKS": [{
        "id": "web-recon",
        "name": "Web recon",
        "trigger": {"tool_id": "nmap", "options": "-sV"},
        "rules": [{"on_service": ["http"], "action": {"tool_id": "curl", "options": "-sI {host}:{port}"}}]
    }]}"#;

    /// Application state over a fresh database and output directory in `dir`.
    pub async fn app_state(dir: &Path) -> Arc<AppState> {
        let url = format!("sqlite://{}", dir.join("scanbay-test.db").display());
        let store = SqliteStore::connect(&url).await.expect("open test database");
        let tools = ToolCatalog::from_json_str(TOOLS).expect("tool catalog");
        let playbooks = PlaybookCatalog::from_json_str(PLAYBOOKS).expect("playbook catalog");
        let runtime = Runtime::new(
            Arc::new(store),
            Arc::new(tools),
            Arc::new(playbooks),
            dir.join("output"),
        );
        let worker_state = runtime.worker(Duration::from_millis(50)).subscribe();

        let mut config = crate::config::Config::from_env();
        config.output_dir = dir.join("output");
        Arc::new(AppState {
            config: Arc::new(config),
            runtime,
            worker_state,
        })
    }

    /// Insert a project with the given targets, returning its id.
    pub async fn seed_project(state: &AppState, targets: &[&str]) -> i64 {
        let pool = state.runtime.store.pool();
        let (project_id,): (i64,) = sqlx::query_as(
            "INSERT INTO projects (name, created_at) VALUES ('test', '2026-01-01T00:00:00Z') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .expect("insert project");
        for value in targets {
            sqlx::query("INSERT INTO targets (project_id, value) VALUES (?1, ?2)")
                .bind(project_id)
                .bind(*value)
                .execute(pool)
                .await
                .expect("insert target");
        }
        project_id
    }
}
