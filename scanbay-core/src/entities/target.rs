use crate::entities::SqliteStore;

use async_trait::async_trait;

/// Supplies the scan targets of a project, in target-list order.
///
/// The playbook engine holds this behind `Arc<dyn TargetSource>`, which is why
/// it is an `async_trait` rather than an `impl Future` trait like the stores.
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn targets_for_project(&self, project_id: i64) -> Result<Vec<String>, sqlx::Error>;
}

#[async_trait]
impl TargetSource for SqliteStore {
    async fn targets_for_project(&self, project_id: i64) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT value FROM targets WHERE project_id = ?1 ORDER BY id ASC")
                .bind(project_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(value,)| value).collect())
    }
}
