use crate::entities::dao::{NewTask, StopTransition, TaskId, TaskRecord, TaskStatus};
use crate::entities::{SqliteStore, now_timestamp, parse_optional_timestamp, parse_timestamp};

use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;

pub trait TaskStore: Send + Sync + 'static {
    /// Persist a new task as `pending` and return the stored row.
    fn insert_task(
        &self,
        task: &NewTask,
    ) -> impl Future<Output = Result<TaskRecord, sqlx::Error>> + Send;
    fn get_task(
        &self,
        id: TaskId,
    ) -> impl Future<Output = Result<Option<TaskRecord>, sqlx::Error>> + Send;
    fn list_tasks(
        &self,
        project_id: Option<i64>,
    ) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;
    /// `pending -> running` with the given pid. Returns `false` if the task
    /// was no longer pending.
    fn mark_task_running(
        &self,
        id: TaskId,
        pid: u32,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
    /// Move a live (`pending` or `running`) task to `status`, clearing its pid.
    ///
    /// A task that already reached a terminal state keeps it. The status the
    /// task holds after the call is returned.
    fn finish_task(
        &self,
        id: TaskId,
        status: TaskStatus,
    ) -> impl Future<Output = Result<TaskStatus, sqlx::Error>> + Send;
    /// Atomically `running -> stopped`, yielding the pid recorded at that moment.
    fn stop_running_task(
        &self,
        id: TaskId,
    ) -> impl Future<Output = Result<StopTransition, sqlx::Error>> + Send;
    /// Mark every `running` task as `error`; used once at startup when no
    /// process from a previous run can still be attached to.
    fn fail_orphaned_running_tasks(
        &self,
    ) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;
}

const TASK_COLUMNS: &str = "id, tool_id, command, status, pid, original_target, raw_output_file, \
     xml_output_file, project_id, created_at, started_at, finished_at, updated_at";

type TaskRow = (
    i64,
    String,
    String,
    String,
    Option<i64>,
    Option<String>,
    String,
    Option<String>,
    Option<i64>,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn task_from_row(row: TaskRow) -> TaskRecord {
    let (
        id,
        tool_id,
        command,
        status,
        pid,
        original_target,
        raw_output_file,
        xml_output_file,
        project_id,
        created_at,
        started_at,
        finished_at,
        updated_at,
    ) = row;

    let command = serde_json::from_str(&command).unwrap_or_else(|e| {
        tracing::warn!(task_id = id, raw = %command, error = %e, "failed to parse stored command");
        Vec::new()
    });
    let status = TaskStatus::from_str(&status).unwrap_or_else(|_| {
        tracing::warn!(task_id = id, raw = %status, "unknown stored task status; treating as error");
        TaskStatus::Error
    });

    TaskRecord {
        id: TaskId(id),
        tool_id,
        command,
        status,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        original_target,
        raw_output_file: PathBuf::from(raw_output_file),
        xml_output_file: xml_output_file.map(PathBuf::from),
        project_id,
        created_at: parse_timestamp(&created_at, "tasks.created_at"),
        started_at: parse_optional_timestamp(started_at, "tasks.started_at"),
        finished_at: parse_optional_timestamp(finished_at, "tasks.finished_at"),
        updated_at: parse_timestamp(&updated_at, "tasks.updated_at"),
    }
}

impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &NewTask) -> Result<TaskRecord, sqlx::Error> {
        let command =
            serde_json::to_string(&task.command).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let now = now_timestamp();
        let sql = format!(
            "INSERT INTO tasks (tool_id, command, status, original_target, raw_output_file, \
             xml_output_file, project_id, created_at, updated_at) \
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?7) RETURNING {TASK_COLUMNS}"
        );
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(&task.tool_id)
            .bind(&command)
            .bind(&task.original_target)
            .bind(task.raw_output_file.to_string_lossy().into_owned())
            .bind(
                task.xml_output_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )
            .bind(task.project_id)
            .bind(&now)
            .fetch_one(self.pool())
            .await?;
        Ok(task_from_row(row))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, sqlx::Error> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(task_from_row))
    }

    async fn list_tasks(&self, project_id: Option<i64>) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let rows: Vec<TaskRow> = match project_id {
            Some(project_id) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 ORDER BY id DESC"
                );
                sqlx::query_as(&sql)
                    .bind(project_id)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC");
                sqlx::query_as(&sql).fetch_all(self.pool()).await?
            }
        };
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    async fn mark_task_running(&self, id: TaskId, pid: u32) -> Result<bool, sqlx::Error> {
        let now = now_timestamp();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', pid = ?1, started_at = ?2, updated_at = ?2 \
             WHERE id = ?3 AND status = 'pending'",
        )
        .bind(i64::from(pid))
        .bind(&now)
        .bind(id.0)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_task(&self, id: TaskId, status: TaskStatus) -> Result<TaskStatus, sqlx::Error> {
        let now = now_timestamp();
        sqlx::query(
            "UPDATE tasks SET status = ?1, pid = NULL, finished_at = ?2, updated_at = ?2 \
             WHERE id = ?3 AND status IN ('pending', 'running')",
        )
        .bind(status.as_ref())
        .bind(&now)
        .bind(id.0)
        .execute(self.pool())
        .await?;

        let (effective,): (String,) = sqlx::query_as("SELECT status FROM tasks WHERE id = ?1")
            .bind(id.0)
            .fetch_one(self.pool())
            .await?;
        Ok(TaskStatus::from_str(&effective).unwrap_or_else(|_| {
            tracing::warn!(task_id = id.0, raw = %effective, "unknown stored task status");
            status
        }))
    }

    async fn stop_running_task(&self, id: TaskId) -> Result<StopTransition, sqlx::Error> {
        let now = now_timestamp();
        let mut tx = self.pool().begin().await?;

        // Touching the row first takes SQLite's write lock, so the pid read
        // below cannot race with the runner's own terminal update.
        let claimed = sqlx::query(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(&now)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(StopTransition::NotRunning);
        }

        let (pid,): (Option<i64>,) = sqlx::query_as("SELECT pid FROM tasks WHERE id = ?1")
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE tasks SET status = 'stopped', pid = NULL, finished_at = ?1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(&now)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StopTransition::Stopped {
            pid: pid.and_then(|p| u32::try_from(p).ok()),
        })
    }

    async fn fail_orphaned_running_tasks(&self) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let now = now_timestamp();
        let sql = format!(
            "UPDATE tasks SET status = 'error', pid = NULL, finished_at = ?1, updated_at = ?1 \
             WHERE status = 'running' RETURNING {TASK_COLUMNS}"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(&now)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }
}
