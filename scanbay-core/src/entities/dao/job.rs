use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use super::task::TaskId;

/// Database-assigned identifier of a job row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two kinds of work the worker loop understands.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    SingleTask,
    Playbook,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Structured payload per job kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobPayload {
    SingleTask { task_id: TaskId },
    Playbook { playbook_id: String, project_id: i64 },
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unknown job kind '{0}'")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct SingleTaskBody {
    task_id: TaskId,
}

#[derive(Deserialize)]
struct PlaybookBody {
    playbook_id: String,
    project_id: i64,
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::SingleTask { .. } => JobKind::SingleTask,
            JobPayload::Playbook { .. } => JobKind::Playbook,
        }
    }

    /// Decode a `(kind, payload)` pair as stored in the `jobs` table.
    ///
    /// The kind string is checked first so that a payload whose shape
    /// happens to fit the other variant is never misrouted.
    pub fn decode(kind: &str, payload: &serde_json::Value) -> Result<Self, PayloadError> {
        let kind =
            JobKind::from_str(kind).map_err(|_| PayloadError::UnknownKind(kind.to_owned()))?;
        let malformed = |source| PayloadError::Malformed { kind, source };
        match kind {
            JobKind::SingleTask => {
                let body: SingleTaskBody =
                    serde_json::from_value(payload.clone()).map_err(malformed)?;
                Ok(JobPayload::SingleTask {
                    task_id: body.task_id,
                })
            }
            JobKind::Playbook => {
                let body: PlaybookBody =
                    serde_json::from_value(payload.clone()).map_err(malformed)?;
                Ok(JobPayload::Playbook {
                    playbook_id: body.playbook_id,
                    project_id: body.project_id,
                })
            }
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            JobPayload::SingleTask { task_id } => serde_json::json!({ "task_id": task_id }),
            JobPayload::Playbook {
                playbook_id,
                project_id,
            } => serde_json::json!({ "playbook_id": playbook_id, "project_id": project_id }),
        }
    }
}

/// A row in the `jobs` table.
///
/// `kind` and `payload` are kept as stored so that a row written by an older
/// build can still be dequeued and failed cleanly; use [`JobRecord::decode`]
/// to obtain the typed payload.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i64,
    pub project_id: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn decode(&self) -> Result<JobPayload, PayloadError> {
        JobPayload::decode(&self.kind, &self.payload)
    }
}
