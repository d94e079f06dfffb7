use scanbay_core::JobRecord;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::schemas::timestamp;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct JobListQuery {
    /// `pending`, `processing`, `completed` or `failed`.
    pub status: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobResponse {
    pub id: i64,
    /// `single_task` or `playbook`.
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i64,
    pub project_id: Option<i64>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<JobRecord> for JobResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id.0,
            kind: job.kind,
            payload: job.payload,
            status: job.status.to_string(),
            priority: job.priority,
            project_id: job.project_id,
            error: job.error,
            created_at: timestamp(&job.created_at),
            started_at: job.started_at.as_ref().map(timestamp),
            completed_at: job.completed_at.as_ref().map(timestamp),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobAccepted {
    pub job_id: i64,
}
