//! Turns `(tool, target, options)` requests into pending task rows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{ToolCatalog, ToolDefinition, is_allowed_tool};
use crate::entities::{
    JobId, JobPayload, NewTask, SqliteStore, TargetSource, TaskRecord, TaskStatus, TaskStore,
};
use crate::runtime::queue::{JobQueue, QueueError};
use crate::validation::{
    ValidationError, check_argv, ensure_within, split_options, validate_query, validate_target,
};

#[derive(Debug, Error)]
pub enum TaskCreateError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("task store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Outcome of queuing one tool against every target of a project.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectScan {
    pub queued: Vec<QueuedTask>,
    /// Targets that failed validation, with the reason.
    pub skipped: Vec<SkippedTarget>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub task: TaskRecord,
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTarget {
    pub target: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct TaskFactory {
    store: Arc<SqliteStore>,
    tools: Arc<ToolCatalog>,
    queue: JobQueue,
    output_dir: PathBuf,
}

impl TaskFactory {
    pub fn new(
        store: Arc<SqliteStore>,
        tools: Arc<ToolCatalog>,
        queue: JobQueue,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            tools,
            queue,
            output_dir: output_dir.into(),
        }
    }

    fn tool(&self, tool_id: &str) -> Result<&ToolDefinition, ValidationError> {
        if !is_allowed_tool(tool_id) {
            return Err(ValidationError::ToolNotAllowed(tool_id.to_owned()));
        }
        self.tools
            .get(tool_id)
            .ok_or_else(|| ValidationError::UnknownTool(tool_id.to_owned()))
    }

    /// Validate the request, build the argument vector and persist a
    /// `pending` task. Nothing is executed.
    ///
    /// Blank `options` fall back to the tool's default options.
    pub async fn create(
        &self,
        tool_id: &str,
        target: &str,
        options: &str,
        project_id: Option<i64>,
    ) -> Result<TaskRecord, TaskCreateError> {
        let tool = self.tool(tool_id)?;
        let target = if tool.takes_query() {
            validate_query(target)?
        } else {
            validate_target(target)?
        };
        let options = if options.trim().is_empty() {
            tool.default_options.as_str()
        } else {
            options
        };
        let option_tokens = split_options(options)?;

        let (raw_output_file, xml_candidate) = self.output_paths(tool_id, project_id);
        let xml_output_file = tool.is_structured(tool_id).then_some(xml_candidate);

        ensure_within(&raw_output_file, &self.output_dir)?;
        if let Some(xml) = &xml_output_file {
            ensure_within(xml, &self.output_dir)?;
        }

        let (command, xml_output_file) =
            build_command(tool, target, &option_tokens, xml_output_file.as_deref());
        check_argv(&command)?;

        let task = self
            .store
            .insert_task(&NewTask {
                tool_id: tool_id.to_owned(),
                command,
                original_target: Some(target.to_owned()),
                raw_output_file,
                xml_output_file,
                project_id,
            })
            .await?;
        info!(task_id = %task.id, tool_id, target, "task created");
        Ok(task)
    }

    /// Create a task and queue a `single_task` job for it.
    pub async fn enqueue_single(
        &self,
        tool_id: &str,
        target: &str,
        options: &str,
        project_id: Option<i64>,
        priority: i64,
    ) -> Result<QueuedTask, TaskCreateError> {
        let task = self.create(tool_id, target, options, project_id).await?;
        let payload = JobPayload::SingleTask { task_id: task.id };
        match self.queue.enqueue(&payload, priority, project_id).await {
            Ok(job_id) => Ok(QueuedTask { task, job_id }),
            Err(err) => {
                // Never leave a pending task that no job will pick up.
                if let Err(store_err) = self.store.finish_task(task.id, TaskStatus::Error).await {
                    warn!(task_id = %task.id, error = %store_err, "failed to retire unqueued task");
                }
                Err(err.into())
            }
        }
    }

    /// Queue `tool_id` against every target of a project. Targets that fail
    /// validation are skipped and reported; an unusable tool fails the call.
    pub async fn enqueue_project_scan(
        &self,
        tool_id: &str,
        options: &str,
        project_id: i64,
        priority: i64,
    ) -> Result<ProjectScan, TaskCreateError> {
        self.tool(tool_id)?;
        let targets = self.store.targets_for_project(project_id).await?;

        let mut scan = ProjectScan::default();
        for target in targets {
            match self
                .enqueue_single(tool_id, &target, options, Some(project_id), priority)
                .await
            {
                Ok(queued) => scan.queued.push(queued),
                Err(TaskCreateError::Invalid(err)) => {
                    warn!(project_id, target = %target, error = %err, "skipping target");
                    scan.skipped.push(SkippedTarget {
                        target,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        info!(
            project_id,
            tool_id,
            queued = scan.queued.len(),
            skipped = scan.skipped.len(),
            "project scan queued"
        );
        Ok(scan)
    }

    fn output_paths(&self, tool_id: &str, project_id: Option<i64>) -> (PathBuf, PathBuf) {
        let scope = project_id.map_or_else(|| "adhoc".to_owned(), |id| format!("project{id}"));
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let base = format!("{tool_id}_{scope}_{stamp}_{}", &unique[..8]);
        (
            self.output_dir.join(format!("{base}.txt")),
            self.output_dir.join(format!("{base}.xml")),
        )
    }
}

/// Expand a tool's command template.
///
/// `{target}` and `{query}` become the target, `{options}` expands to zero or
/// more tokens and `{xml_output}` to the structured output path. When the tool
/// produces structured output but its template has no `{xml_output}` slot,
/// `-oX <path>` is appended unless the options already choose an XML output.
/// The returned path is `None` whenever scanbay does not manage the XML file.
pub fn build_command(
    tool: &ToolDefinition,
    target: &str,
    options: &[String],
    xml_output: Option<&Path>,
) -> (Vec<String>, Option<PathBuf>) {
    let mut argv = Vec::with_capacity(tool.command.len() + options.len() + 2);
    for part in &tool.command {
        match part.as_str() {
            "{target}" | "{query}" => argv.push(target.to_owned()),
            "{options}" => argv.extend(options.iter().cloned()),
            "{xml_output}" => {
                if let Some(path) = xml_output {
                    argv.push(path.to_string_lossy().into_owned());
                }
            }
            literal => argv.push(literal.to_owned()),
        }
    }

    let Some(xml) = xml_output else {
        return (argv, None);
    };
    if tool.uses_xml_placeholder() {
        return (argv, Some(xml.to_path_buf()));
    }
    if options.iter().any(|o| o == "-oX" || o == "-oA") {
        return (argv, None);
    }
    argv.push("-oX".to_owned());
    argv.push(xml.to_string_lossy().into_owned());
    (argv, Some(xml.to_path_buf()))
}
