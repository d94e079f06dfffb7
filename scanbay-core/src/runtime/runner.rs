//! Executes a single task's command and records its lifecycle.
//!
//! Output handling: stdout and stderr are read line by line by two pump
//! tasks into one bounded channel, and a single writer appends each line to
//! the task's raw output file as it arrives. The file therefore holds a
//! header, the interleaved output, and a footer naming the final status.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::catalog::{ToolCatalog, is_allowed_tool};
use crate::entities::{SqliteStore, StopTransition, TaskId, TaskRecord, TaskStatus, TaskStore};
use crate::runtime::process::kill_process_tree;
use crate::validation::{ValidationError, check_argv, ensure_within, ensure_within_resolved};

const SEPARATOR: &str = "--------------------------------------------------";
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
pub(crate) const STOP_NOTICE: &str = "--- Task manually stopped by user ---";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} is {status}; only pending tasks can be run")]
    NotPending { id: TaskId, status: TaskStatus },

    #[error("task store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} is not running")]
    NotRunning(TaskId),

    #[error("task store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Result of a stop request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The task was running and has been stopped.
    Stopped { pid: Option<u32>, signalled: usize },
    /// The task had already reached a terminal state.
    AlreadyFinished { status: TaskStatus },
}

/// Faults after preflight; every one of them ends the task in `error`.
#[derive(Debug, Error)]
enum ExecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sandbox(#[from] ValidationError),

    #[error("task store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("task has an empty command")]
    EmptyCommand,

    #[error("spawned process has no pid")]
    NoPid,

    #[error("task left the pending state before its process started")]
    NoLongerPending,
}

#[derive(Clone, Debug)]
pub struct TaskRunner {
    store: Arc<SqliteStore>,
    tools: Arc<ToolCatalog>,
    output_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(
        store: Arc<SqliteStore>,
        tools: Arc<ToolCatalog>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            tools,
            output_dir: output_dir.into(),
        }
    }

    /// Run a pending task to completion and return its final record.
    ///
    /// Failures of the task itself (refused preflight, spawn errors, I/O
    /// faults) are recorded as status `error` and still return `Ok`. `Err` is
    /// reserved for a missing or non-pending task and for store failures.
    pub async fn run(&self, id: TaskId) -> Result<TaskRecord, RunnerError> {
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or(RunnerError::NotFound(id))?;
        if task.status != TaskStatus::Pending {
            return Err(RunnerError::NotPending {
                id,
                status: task.status,
            });
        }

        if let Err(err) = self.preflight(&task) {
            warn!(task_id = %id, tool_id = %task.tool_id, error = %err, "task refused before launch");
            self.store.finish_task(id, TaskStatus::Error).await?;
            return self.reload(id).await;
        }

        let status = match self.execute(&task).await {
            Ok(status) => status,
            Err(err) => {
                error!(task_id = %id, error = %err, "task execution failed");
                TaskStatus::Error
            }
        };

        let effective = self.store.finish_task(id, status).await?;
        if let Err(err) = append_footer(&task.raw_output_file, effective).await {
            warn!(task_id = %id, error = %err, "failed to write output footer");
        }
        info!(task_id = %id, status = %effective, "task finished");
        self.reload(id).await
    }

    fn preflight(&self, task: &TaskRecord) -> Result<(), ValidationError> {
        if !is_allowed_tool(&task.tool_id) {
            return Err(ValidationError::ToolNotAllowed(task.tool_id.clone()));
        }
        if self.tools.get(&task.tool_id).is_none() {
            return Err(ValidationError::UnknownTool(task.tool_id.clone()));
        }
        ensure_within(&task.raw_output_file, &self.output_dir)?;
        if let Some(xml) = &task.xml_output_file {
            ensure_within(xml, &self.output_dir)?;
        }
        check_argv(&task.command)
    }

    async fn execute(&self, task: &TaskRecord) -> Result<TaskStatus, ExecError> {
        let (program, args) = task.command.split_first().ok_or(ExecError::EmptyCommand)?;

        for path in std::iter::once(&task.raw_output_file).chain(task.xml_output_file.as_ref()) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            ensure_within_resolved(path, &self.output_dir)?;
        }
        write_header(&task.raw_output_file, &task.command_line()).await?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group so stop can reach descendants that outlive the launcher.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;
        let Some(pid) = child.id() else {
            abort(&mut child).await;
            return Err(ExecError::NoPid);
        };

        match self.store.mark_task_running(task.id, pid).await {
            Ok(true) => {}
            Ok(false) => {
                abort(&mut child).await;
                return Err(ExecError::NoLongerPending);
            }
            Err(err) => {
                abort(&mut child).await;
                return Err(err.into());
            }
        }
        info!(task_id = %task.id, pid, command = %task.command_line(), "process started");

        if let Err(err) = capture_output(&mut child, &task.raw_output_file).await {
            abort(&mut child).await;
            return Err(err.into());
        }

        let exit = child.wait().await?;
        debug!(task_id = %task.id, pid, exit = %exit, "process exited");
        Ok(if exit.success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        })
    }

    async fn reload(&self, id: TaskId) -> Result<TaskRecord, RunnerError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(RunnerError::NotFound(id))
    }

    /// Stop a running task and kill its process tree.
    ///
    /// The task is marked `stopped` before any signal is sent, so the runner
    /// observing the process exit cannot record a different status.
    pub async fn stop(&self, id: TaskId) -> Result<StopOutcome, StopError> {
        match self.store.stop_running_task(id).await? {
            StopTransition::Stopped { pid } => {
                // Written before the kill so it always precedes the footer.
                match self.store.get_task(id).await {
                    Ok(Some(task)) => {
                        let notice = format!("\n{STOP_NOTICE}\n");
                        if let Err(err) = append_text(&task.raw_output_file, &notice).await {
                            warn!(task_id = %id, error = %err, "failed to write stop notice");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(task_id = %id, error = %err, "could not load task for stop notice")
                    }
                }

                let signalled = match pid {
                    Some(pid) => kill_process_tree(pid).await.unwrap_or_else(|err| {
                        warn!(task_id = %id, pid, error = %err, "process tree kill did not complete");
                        0
                    }),
                    None => 0,
                };
                info!(task_id = %id, pid = ?pid, signalled, "task stopped");
                Ok(StopOutcome::Stopped { pid, signalled })
            }
            StopTransition::NotRunning => {
                let task = self
                    .store
                    .get_task(id)
                    .await?
                    .ok_or(StopError::NotFound(id))?;
                if task.status.is_terminal() {
                    debug!(task_id = %id, status = %task.status, "stop requested for finished task");
                    Ok(StopOutcome::AlreadyFinished {
                        status: task.status,
                    })
                } else {
                    Err(StopError::NotRunning(id))
                }
            }
        }
    }
}

async fn abort(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "kill after fault failed");
    }
    let _ = child.wait().await;
}

fn utc_stamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

async fn write_header(path: &Path, command_line: &str) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    let header = format!(
        "Command: {command_line}\nStarted: {}\n{SEPARATOR}\n\n",
        utc_stamp()
    );
    file.write_all(header.as_bytes()).await?;
    file.flush().await
}

pub(crate) async fn append_footer(path: &Path, status: TaskStatus) -> std::io::Result<()> {
    let footer = format!(
        "\n{SEPARATOR}\nFinished: {}\nStatus: {status}\n",
        utc_stamp()
    );
    append_text(path, &footer).await
}

pub(crate) async fn append_text(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

/// Copy the child's stdout and stderr into `path` until both reach EOF.
async fn capture_output(child: &mut Child, path: &Path) -> std::io::Result<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(stderr, tx.clone())));
    }
    drop(tx);

    let mut file = OpenOptions::new().append(true).open(path).await?;
    let written = async {
        while let Some(line) = rx.recv().await {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    }
    .await;

    // Closing the receiver makes the pumps stop at their next send.
    drop(rx);
    for pump in pumps {
        if let Err(err) = pump.await {
            debug!(error = %err, "output pump ended abnormally");
        }
    }
    written
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "output stream read failed");
                break;
            }
        }
    }
}

/// The last `lines` lines of a task's raw output file.
///
/// The file is streamed, so memory stays bounded by `lines` however large
/// the output grew.
pub async fn output_tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut tail = VecDeque::with_capacity(lines.min(OUTPUT_CHANNEL_CAPACITY));
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        let text = String::from_utf8_lossy(&line);
        tail.push_back(text.trim_end_matches(['\n', '\r']).to_owned());
    }
    Ok(tail.into())
}

#[cfg(all(test, unix))]
mod test {
    use super::*;
    use crate::entities::NewTask;
    use crate::entities::testing::store_in;

    fn catalog() -> Arc<ToolCatalog> {
        Arc::new(
            ToolCatalog::from_json_str(r#"{"curl": {"command": ["curl", "{target}"]}}"#).unwrap(),
        )
    }

    async fn insert(store: &SqliteStore, command: &[&str], output: PathBuf) -> TaskRecord {
        store
            .insert_task(&NewTask {
                tool_id: "curl".into(),
                command: command.iter().map(|s| s.to_string()).collect(),
                original_target: None,
                raw_output_file: output,
                xml_output_file: None,
                project_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_between_header_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let out = dir.path().join("out");
        let runner = TaskRunner::new(store.clone(), catalog(), &out);

        // Redirection would trip the metacharacter check, so it lives in a script.
        let script = dir.path().join("both.sh");
        std::fs::write(&script, "echo to-stdout\necho to-stderr 1>&2\n").unwrap();
        let script = script.to_string_lossy().into_owned();

        let task = insert(&store, &["sh", &script], out.join("nested/run.txt")).await;
        let finished = runner.run(task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.pid, None);

        let text = std::fs::read_to_string(out.join("nested/run.txt")).unwrap();
        assert!(text.starts_with("Command: sh "));
        assert!(text.contains("to-stdout\n"));
        assert!(text.contains("to-stderr\n"));
        assert!(text.trim_end().ends_with("Status: completed"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let runner = TaskRunner::new(store.clone(), catalog(), dir.path());

        let task = insert(&store, &["sh", "-c", "exit 3"], dir.path().join("exit.txt")).await;
        let finished = runner.run(task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        let text = std::fs::read_to_string(dir.path().join("exit.txt")).unwrap();
        assert!(text.contains("Status: failed"));
    }

    #[tokio::test]
    async fn missing_program_is_error_without_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let runner = TaskRunner::new(store.clone(), catalog(), dir.path());

        let task = insert(&store, &["scanbay-no-such-binary"], dir.path().join("x.txt")).await;
        let finished = runner.run(task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Error);
        assert_eq!(finished.pid, None);
    }

    #[tokio::test]
    async fn preflight_refuses_paths_outside_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let runner = TaskRunner::new(store.clone(), catalog(), dir.path().join("out"));

        let escape = dir.path().join("out/../escape.txt");
        let task = insert(&store, &["echo", "hi"], escape.clone()).await;
        let finished = runner.run(task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Error);
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn preflight_refuses_metacharacters_in_stored_command() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let runner = TaskRunner::new(store.clone(), catalog(), dir.path());

        let marker = dir.path().join("pwned");
        let payload = format!("x; touch {}", marker.display());
        let task = insert(&store, &["echo", &payload], dir.path().join("m.txt")).await;
        let finished = runner.run(task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Error);
        assert!(!marker.exists());
        assert!(!dir.path().join("m.txt").exists());
    }

    #[tokio::test]
    async fn only_pending_tasks_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let runner = TaskRunner::new(store.clone(), catalog(), dir.path());

        let task = insert(&store, &["echo", "once"], dir.path().join("o.txt")).await;
        runner.run(task.id).await.unwrap();
        assert!(matches!(
            runner.run(task.id).await,
            Err(RunnerError::NotPending { status: TaskStatus::Completed, .. })
        ));
        assert!(matches!(
            runner.run(TaskId(999)).await,
            Err(RunnerError::NotFound(TaskId(999)))
        ));
    }

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(output_tail(&path, 2).await.unwrap(), vec!["c", "d"]);
        assert_eq!(output_tail(&path, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn tail_of_large_output_keeps_only_the_requested_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let mut body = Vec::new();
        for n in 0..50_000 {
            body.extend_from_slice(format!("line {n}\r\n").as_bytes());
        }
        body.extend_from_slice(b"partial \xff");
        std::fs::write(&path, body).unwrap();

        let tail = output_tail(&path, 3).await.unwrap();
        assert_eq!(tail, vec!["line 49998", "line 49999", "partial \u{fffd}"]);
        assert!(output_tail(&path, 0).await.unwrap().is_empty());
    }
}
