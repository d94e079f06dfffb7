use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Database-assigned identifier of a task row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one tool invocation.
///
/// `Pending -> Running -> {Completed | Failed | Error | Stopped}`, plus
/// `Pending -> Error` when the runner refuses or fails to launch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Error | TaskStatus::Stopped
        )
    }
}

/// A row in the `tasks` table.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub tool_id: String,
    /// Fully resolved argument vector; `command[0]` is the program.
    pub command: Vec<String>,
    pub status: TaskStatus,
    /// OS process id, present only while `status == Running`.
    pub pid: Option<u32>,
    pub original_target: Option<String>,
    pub raw_output_file: PathBuf,
    /// Structured (Nmap XML) output; `None` for tools without one.
    pub xml_output_file: Option<PathBuf>,
    pub project_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Human-readable command line, quoted so it can be pasted into a shell.
    pub fn command_line(&self) -> String {
        display_command(&self.command)
    }
}

pub(crate) fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shlex::try_quote(arg).map_or_else(|_| arg.clone(), |q| q.into_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything needed to insert a fresh `pending` task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tool_id: String,
    pub command: Vec<String>,
    pub original_target: Option<String>,
    pub raw_output_file: PathBuf,
    pub xml_output_file: Option<PathBuf>,
    pub project_id: Option<i64>,
}

/// Result of atomically moving a task from `running` to `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTransition {
    /// The task was running and is now stopped; `pid` is the process that
    /// was recorded at the moment of the transition.
    Stopped { pid: Option<u32> },
    /// The task was not running when the transition was attempted.
    NotRunning,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_its_column_text() {
        assert_eq!(TaskStatus::Completed.as_ref(), "completed");
        assert_eq!(TaskStatus::from_str("stopped").unwrap(), TaskStatus::Stopped);
        assert!(TaskStatus::from_str("starting").is_err());
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Stopped.is_terminal());
    }

    #[test]
    fn command_line_quotes_arguments_with_spaces() {
        let argv = vec![
            "searchsploit".to_owned(),
            "apache 2.4".to_owned(),
            "--json".to_owned(),
        ];
        assert_eq!(display_command(&argv), "searchsploit 'apache 2.4' --json");
    }
}
