use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::entities::{JobId, JobPayload, JobRecord, SqliteStore, TaskId, TaskStatus, TaskStore};
use crate::runtime::playbook::PlaybookEngine;
use crate::runtime::queue::{JobOutcome, JobQueue, QueueError};
use crate::runtime::runner::{TaskRunner, append_footer, append_text};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

const INTERRUPTED_NOTICE: &str =
    "--- Task interrupted: the server restarted while it was running ---";

/// What the worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    IdlePolling,
    Executing { job_id: JobId },
}

/// Work found and repaired at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub jobs_requeued: u64,
    pub tasks_interrupted: usize,
}

/// The single consumer of the job queue.
///
/// Jobs run strictly one at a time. Each one executes inside its own spawned
/// tokio task which the loop awaits, so a panic while handling a job is
/// recorded as a failed job and the loop carries on.
pub struct Worker {
    store: Arc<SqliteStore>,
    queue: JobQueue,
    runner: TaskRunner,
    engine: PlaybookEngine,
    poll_interval: Duration,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(
        store: Arc<SqliteStore>,
        queue: JobQueue,
        runner: TaskRunner,
        engine: PlaybookEngine,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::IdlePolling);
        Self {
            store,
            queue,
            runner,
            engine,
            poll_interval,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Re-queue jobs left `processing` and fail tasks left `running` by a
    /// previous process. Their subprocesses cannot be reattached.
    pub async fn recover(&self) -> Result<RecoveryReport, QueueError> {
        let jobs_requeued = self.queue.recover_orphaned().await?;
        let interrupted = self.store.fail_orphaned_running_tasks().await?;
        for task in &interrupted {
            warn!(task_id = %task.id, tool_id = %task.tool_id, "task was running at shutdown; marked error");
            let notice = format!("\n{INTERRUPTED_NOTICE}\n");
            let written = match append_text(&task.raw_output_file, &notice).await {
                Ok(()) => append_footer(&task.raw_output_file, TaskStatus::Error).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                warn!(task_id = %task.id, error = %err, "failed to annotate interrupted task output");
            }
        }
        Ok(RecoveryReport {
            jobs_requeued,
            tasks_interrupted: interrupted.len(),
        })
    }

    /// Claim and execute at most one job. Returns `None` when the queue was empty.
    pub async fn tick(&self) -> Option<(JobId, JobOutcome)> {
        let job = self.queue.dequeue_next().await?;
        let id = job.id;
        self.state.send_replace(WorkerState::Executing { job_id: id });
        info!(job_id = %id, kind = %job.kind, "job started");

        let outcome = self.execute(job).await;
        match &outcome {
            JobOutcome::Completed => info!(job_id = %id, "job completed"),
            JobOutcome::Failed(reason) => warn!(job_id = %id, reason = %reason, "job failed"),
        }
        if let Err(err) = self.queue.complete(id, &outcome).await {
            error!(job_id = %id, error = %err, "failed to record job outcome");
        }

        self.state.send_replace(WorkerState::IdlePolling);
        Some((id, outcome))
    }

    async fn execute(&self, job: JobRecord) -> JobOutcome {
        let payload = match job.decode() {
            Ok(payload) => payload,
            Err(err) => return JobOutcome::Failed(err.to_string()),
        };

        let handle = match payload {
            JobPayload::SingleTask { task_id } => {
                let runner = self.runner.clone();
                tokio::spawn(async move { run_single_task(runner, task_id).await })
            }
            JobPayload::Playbook {
                playbook_id,
                project_id,
            } => {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    match engine.run(&playbook_id, project_id).await {
                        Ok(report) => {
                            info!(
                                playbook_id = %report.playbook_id,
                                targets = report.targets_scanned,
                                trigger_failures = report.trigger_failures,
                                services = report.services_found,
                                queued = report.tasks_queued,
                                "playbook report"
                            );
                            JobOutcome::Completed
                        }
                        Err(err) => JobOutcome::Failed(err.to_string()),
                    }
                })
            }
        };

        match handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => JobOutcome::Failed("job handler panicked".to_owned()),
            Err(err) => JobOutcome::Failed(err.to_string()),
        }
    }

    /// Run recovery, then poll until `shutdown` turns `true`.
    ///
    /// Shutdown is checked between jobs; a job in progress is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.recover().await {
            Ok(report) => info!(
                jobs_requeued = report.jobs_requeued,
                tasks_interrupted = report.tasks_interrupted,
                "worker recovery complete"
            ),
            Err(err) => error!(error = %err, "worker recovery failed"),
        }
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.tick().await.is_some() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("worker stopped");
    }
}

async fn run_single_task(runner: TaskRunner, task_id: TaskId) -> JobOutcome {
    match runner.run(task_id).await {
        Ok(task) => match task.status {
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped => {
                JobOutcome::Completed
            }
            status => JobOutcome::Failed(format!("task {task_id} ended {status}")),
        },
        Err(err) => JobOutcome::Failed(err.to_string()),
    }
}
