use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::entities::{JobId, JobPayload, JobRecord, JobStatus, JobStore, PayloadError, SqliteStore};

/// Accepted range for job priorities; higher runs first.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i64> = 0..=100;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("priority {0} is outside 0..=100")]
    InvalidPriority(i64),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("job store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// How a dequeued job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Durable FIFO-within-priority queue backed by the `jobs` table.
#[derive(Clone, Debug)]
pub struct JobQueue {
    store: Arc<SqliteStore>,
}

impl JobQueue {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue(
        &self,
        payload: &JobPayload,
        priority: i64,
        project_id: Option<i64>,
    ) -> Result<JobId, QueueError> {
        if !PRIORITY_RANGE.contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }
        let kind = payload.kind();
        let id = self
            .store
            .insert_job(kind.as_ref(), &payload.to_value(), priority, project_id)
            .await?;
        info!(job_id = %id, kind = %kind, priority, "job enqueued");
        Ok(id)
    }

    /// Enqueue an untyped `(kind, payload)` pair, rejecting unknown kinds and
    /// payloads that do not fit their kind.
    pub async fn enqueue_raw(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        priority: i64,
        project_id: Option<i64>,
    ) -> Result<JobId, QueueError> {
        let payload = JobPayload::decode(kind, payload)?;
        self.enqueue(&payload, priority, project_id).await
    }

    /// Claim the next job, or `None` when the queue is empty.
    ///
    /// Store failures are logged and reported as an empty queue so the worker
    /// simply retries on its next poll.
    pub async fn dequeue_next(&self) -> Option<JobRecord> {
        match self.store.dequeue_next_job().await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, kind = %job.kind, "job dequeued");
                Some(job)
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "failed to dequeue job");
                None
            }
        }
    }

    pub async fn complete(&self, id: JobId, outcome: &JobOutcome) -> Result<(), QueueError> {
        match outcome {
            JobOutcome::Completed => {
                self.store.complete_job(id, JobStatus::Completed, None).await?;
            }
            JobOutcome::Failed(reason) => {
                self.store
                    .complete_job(id, JobStatus::Failed, Some(reason))
                    .await?;
            }
        }
        Ok(())
    }

    /// Put jobs left `processing` by a previous run back in line.
    pub async fn recover_orphaned(&self) -> Result<u64, QueueError> {
        let requeued = self.store.requeue_processing_jobs().await?;
        if requeued > 0 {
            info!(requeued, "re-queued jobs interrupted by a restart");
        }
        Ok(requeued)
    }

    /// Remove a job that has not started yet. Returns `false` when it is
    /// unknown or already claimed.
    pub async fn cancel_pending(&self, id: JobId) -> Result<bool, QueueError> {
        Ok(self.store.delete_pending_job(id).await?)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self.store.list_jobs(status).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::TaskId;
    use crate::entities::testing::store_in;
    use serde_json::json;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn priority_outside_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::new(Arc::new(store_in(dir.path()).await));
        let payload = JobPayload::SingleTask { task_id: TaskId(1) };

        assert!(matches!(
            queue.enqueue(&payload, 101, None).await,
            Err(QueueError::InvalidPriority(101))
        ));
        assert!(matches!(
            queue.enqueue(&payload, -1, None).await,
            Err(QueueError::InvalidPriority(-1))
        ));
        assert!(queue.enqueue(&payload, 100, None).await.is_ok());
    }

    #[tokio::test]
    async fn raw_enqueue_rejects_unknown_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::new(Arc::new(store_in(dir.path()).await));

        let err = queue
            .enqueue_raw("shell", &json!({ "cmd": "id" }), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Payload(PayloadError::UnknownKind(_))));

        let id = queue
            .enqueue_raw("playbook", &json!({ "playbook_id": "web", "project_id": 2 }), 0, Some(2))
            .await
            .unwrap();
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.kind, "playbook");
        assert_eq!(job.project_id, Some(2));
    }

    #[tokio::test]
    async fn dequeue_follows_priority_then_age() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::new(Arc::new(store_in(dir.path()).await));

        let mut ids = Vec::new();
        for (task, priority) in [(1, 0), (2, 5), (3, 0)] {
            let payload = JobPayload::SingleTask { task_id: TaskId(task) };
            ids.push(queue.enqueue(&payload, priority, None).await.unwrap());
        }

        let order: Vec<JobId> = [
            queue.dequeue_next().await.unwrap().id,
            queue.dequeue_next().await.unwrap().id,
            queue.dequeue_next().await.unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![ids[1], ids[0], ids[2]]);
        assert!(queue.dequeue_next().await.is_none());
    }

    #[tokio::test]
    async fn recovered_job_is_dequeued_again() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::new(Arc::new(store_in(dir.path()).await));
        let payload = JobPayload::SingleTask { task_id: TaskId(1) };
        let id = queue.enqueue(&payload, 0, None).await.unwrap();

        // Simulate a crash between dequeue and completion.
        assert_eq!(queue.dequeue_next().await.unwrap().id, id);
        assert!(queue.dequeue_next().await.is_none());

        assert_eq!(queue.recover_orphaned().await.unwrap(), 1);
        let again = queue.dequeue_next().await.unwrap();
        assert_eq!(again.id, id);

        queue.complete(id, &JobOutcome::Failed("boom".into())).await.unwrap();
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(queue.list(Some(JobStatus::Failed)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::new(Arc::new(store_in(dir.path()).await));
        let payload = JobPayload::SingleTask { task_id: TaskId(1) };
        let running = queue.enqueue(&payload, 0, None).await.unwrap();
        let waiting = queue.enqueue(&payload, 0, None).await.unwrap();
        queue.dequeue_next().await.unwrap();

        assert!(!queue.cancel_pending(running).await.unwrap());
        assert!(queue.cancel_pending(waiting).await.unwrap());
        assert!(!queue.cancel_pending(waiting).await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn store_failure_surfaces_on_enqueue_and_reads_as_empty_on_dequeue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let queue = JobQueue::new(store.clone());
        store.pool().close().await;

        let payload = JobPayload::SingleTask { task_id: TaskId(1) };
        assert!(matches!(
            queue.enqueue(&payload, 0, None).await,
            Err(QueueError::Store(_))
        ));
        assert!(queue.dequeue_next().await.is_none());
        assert!(logs_contain("failed to dequeue job"));
    }
}
