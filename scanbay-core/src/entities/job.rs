use crate::entities::dao::{JobId, JobRecord, JobStatus};
use crate::entities::{SqliteStore, now_timestamp, parse_optional_timestamp, parse_timestamp};

use std::future::Future;
use std::str::FromStr;

pub trait JobStore: Send + Sync + 'static {
    fn insert_job(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        priority: i64,
        project_id: Option<i64>,
    ) -> impl Future<Output = Result<JobId, sqlx::Error>> + Send;
    /// Select the next pending job and mark it `processing` in one statement.
    fn dequeue_next_job(
        &self,
    ) -> impl Future<Output = Result<Option<JobRecord>, sqlx::Error>> + Send;
    fn complete_job(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    /// Reset every `processing` job to `pending`; returns how many were reset.
    fn requeue_processing_jobs(&self) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
    fn get_job(
        &self,
        id: JobId,
    ) -> impl Future<Output = Result<Option<JobRecord>, sqlx::Error>> + Send;
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
    ) -> impl Future<Output = Result<Vec<JobRecord>, sqlx::Error>> + Send;
    /// Delete a job that has not been picked up yet. Returns `false` if the
    /// job does not exist or is no longer pending.
    fn delete_pending_job(
        &self,
        id: JobId,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

const JOB_COLUMNS: &str =
    "id, kind, payload, status, priority, project_id, error, created_at, started_at, completed_at";

type JobRow = (
    i64,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn job_from_row(row: JobRow) -> JobRecord {
    let (
        id,
        kind,
        payload,
        status,
        priority,
        project_id,
        error,
        created_at,
        started_at,
        completed_at,
    ) = row;

    // An unparseable payload is kept as a JSON string so the worker can
    // still fail the job with a decode error.
    let payload = serde_json::from_str(&payload).unwrap_or_else(|e| {
        tracing::warn!(job_id = id, error = %e, "stored job payload is not valid JSON");
        serde_json::Value::String(payload)
    });
    let status = JobStatus::from_str(&status).unwrap_or_else(|_| {
        tracing::warn!(job_id = id, raw = %status, "unknown stored job status; treating as failed");
        JobStatus::Failed
    });

    JobRecord {
        id: JobId(id),
        kind,
        payload,
        status,
        priority,
        project_id,
        error,
        created_at: parse_timestamp(&created_at, "jobs.created_at"),
        started_at: parse_optional_timestamp(started_at, "jobs.started_at"),
        completed_at: parse_optional_timestamp(completed_at, "jobs.completed_at"),
    }
}

impl JobStore for SqliteStore {
    async fn insert_job(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        priority: i64,
        project_id: Option<i64>,
    ) -> Result<JobId, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs (kind, payload, status, priority, project_id, created_at) \
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5) RETURNING id",
        )
        .bind(kind)
        .bind(payload.to_string())
        .bind(priority)
        .bind(project_id)
        .bind(now_timestamp())
        .fetch_one(self.pool())
        .await?;
        Ok(JobId(id))
    }

    async fn dequeue_next_job(&self) -> Result<Option<JobRecord>, sqlx::Error> {
        let sql = format!(
            "UPDATE jobs SET status = 'processing', started_at = ?1 \
             WHERE id = (SELECT id FROM jobs WHERE status = 'pending' \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(now_timestamp())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(job_from_row))
    }

    async fn complete_job(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET status = ?1, error = ?2, completed_at = ?3 WHERE id = ?4")
            .bind(status.as_ref())
            .bind(error)
            .bind(now_timestamp())
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn requeue_processing_jobs(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL WHERE status = 'processing'",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, sqlx::Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(job_from_row))
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, sqlx::Error> {
        let rows: Vec<JobRow> = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 \
                     ORDER BY priority DESC, created_at ASC, id ASC"
                );
                sqlx::query_as(&sql)
                    .bind(status.as_ref())
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC");
                sqlx::query_as(&sql).fetch_all(self.pool()).await?
            }
        };
        Ok(rows.into_iter().map(job_from_row).collect())
    }

    async fn delete_pending_job(&self, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1 AND status = 'pending'")
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::testing::store_in;
    use serde_json::json;

    #[tokio::test]
    async fn dequeue_marks_processing_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let id = store
            .insert_job("single_task", &json!({ "task_id": 1 }), 0, None)
            .await
            .unwrap();

        let job = store.dequeue_next_job().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert_eq!(job.payload, json!({ "task_id": 1 }));

        assert!(store.dequeue_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let a = store.insert_job("single_task", &json!({ "task_id": 1 }), 0, None).await.unwrap();
        let b = store.insert_job("single_task", &json!({ "task_id": 2 }), 5, None).await.unwrap();
        let c = store.insert_job("single_task", &json!({ "task_id": 3 }), 0, None).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = store.dequeue_next_job().await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![b, a, c]);
    }

    #[tokio::test]
    async fn requeue_resets_processing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let payload = json!({ "playbook_id": "x", "project_id": 1 });
        let id = store.insert_job("playbook", &payload, 0, Some(1)).await.unwrap();
        store.dequeue_next_job().await.unwrap();

        assert_eq!(store.requeue_processing_jobs().await.unwrap(), 1);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn complete_records_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let id = store.insert_job("single_task", &json!({ "task_id": 1 }), 0, None).await.unwrap();
        store.dequeue_next_job().await.unwrap();

        store.complete_job(id, JobStatus::Failed, Some("boom")).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.completed_at.is_some());

        let failed = store.list_jobs(Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(store.list_jobs(Some(JobStatus::Pending)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_pending_jobs_can_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let first = store
            .insert_job("single_task", &json!({ "task_id": 1 }), 0, None)
            .await
            .unwrap();
        let second = store
            .insert_job("single_task", &json!({ "task_id": 2 }), 0, None)
            .await
            .unwrap();
        store.dequeue_next_job().await.unwrap();

        assert!(!store.delete_pending_job(first).await.unwrap());
        assert!(store.delete_pending_job(second).await.unwrap());
        assert!(store.get_job(second).await.unwrap().is_none());
    }
}
