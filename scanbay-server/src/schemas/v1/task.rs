use scanbay_core::parser::service_protocol;
use scanbay_core::runtime::factory::SkippedTarget;
use scanbay_core::{DiscoveredService, ProjectScan, QueuedTask, StopOutcome, TaskId, TaskRecord};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::schemas::timestamp;

/// Default number of lines returned by the output endpoint.
pub const DEFAULT_OUTPUT_LINES: usize = 200;
/// Upper bound on `lines` for the output endpoint.
pub const MAX_OUTPUT_LINES: usize = 5000;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    /// Tool id from the tool catalog, e.g. `"nmap"`.
    pub tool_id: String,
    /// IP, CIDR, domain or URL; a free-text query for query tools.
    pub target: String,
    /// Tool options; the tool's default options are used when blank.
    #[serde(default)]
    pub options: String,
    pub project_id: Option<i64>,
    /// Job priority in `0..=100`; higher runs first.
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProjectScanRequest {
    pub tool_id: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TaskListQuery {
    /// Only tasks belonging to this project.
    pub project_id: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OutputQuery {
    /// Number of trailing lines to return (default 200, max 5000).
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: i64,
    pub tool_id: String,
    pub command: Vec<String>,
    /// Shell-quoted rendering of `command`.
    pub command_line: String,
    pub status: String,
    pub pid: Option<u32>,
    pub original_target: Option<String>,
    pub raw_output_file: String,
    pub xml_output_file: Option<String>,
    pub project_id: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

impl From<TaskRecord> for TaskResponse {
    fn from(task: TaskRecord) -> Self {
        Self {
            id: task.id.0,
            command_line: task.command_line(),
            tool_id: task.tool_id,
            command: task.command,
            status: task.status.to_string(),
            pid: task.pid,
            original_target: task.original_target,
            raw_output_file: task.raw_output_file.display().to_string(),
            xml_output_file: task.xml_output_file.map(|p| p.display().to_string()),
            project_id: task.project_id,
            created_at: timestamp(&task.created_at),
            started_at: task.started_at.as_ref().map(timestamp),
            finished_at: task.finished_at.as_ref().map(timestamp),
            updated_at: timestamp(&task.updated_at),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueuedTaskResponse {
    pub task: TaskResponse,
    pub job_id: i64,
}

impl From<QueuedTask> for QueuedTaskResponse {
    fn from(queued: QueuedTask) -> Self {
        Self {
            job_id: queued.job_id.0,
            task: queued.task.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SkippedTargetResponse {
    pub target: String,
    pub reason: String,
}

impl From<SkippedTarget> for SkippedTargetResponse {
    fn from(skipped: SkippedTarget) -> Self {
        Self {
            target: skipped.target,
            reason: skipped.reason,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProjectScanResponse {
    pub queued: Vec<QueuedTaskResponse>,
    /// Project targets that failed validation and were not queued.
    pub skipped: Vec<SkippedTargetResponse>,
}

impl From<ProjectScan> for ProjectScanResponse {
    fn from(scan: ProjectScan) -> Self {
        Self {
            queued: scan.queued.into_iter().map(Into::into).collect(),
            skipped: scan.skipped.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskOutputResponse {
    pub task_id: i64,
    pub status: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StopResponse {
    pub task_id: i64,
    /// `true` when this request moved the task to `stopped`.
    pub stopped: bool,
    /// Status of the task after the request.
    pub status: String,
    pub pid: Option<u32>,
    /// Number of processes in the tree that were sent a kill signal.
    pub processes_signalled: usize,
}

impl StopResponse {
    pub fn new(task_id: TaskId, outcome: StopOutcome) -> Self {
        match outcome {
            StopOutcome::Stopped { pid, signalled } => Self {
                task_id: task_id.0,
                stopped: true,
                status: "stopped".to_owned(),
                pid,
                processes_signalled: signalled,
            },
            StopOutcome::AlreadyFinished { status } => Self {
                task_id: task_id.0,
                stopped: false,
                status: status.to_string(),
                pid: None,
                processes_signalled: 0,
            },
        }
    }
}

/// One open service read back from a task's results.
#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceResponse {
    pub host: String,
    pub port: String,
    /// `http` or `https`.
    pub protocol: String,
    pub service_name: String,
    pub product: String,
    pub version: String,
}

impl From<DiscoveredService> for ServiceResponse {
    fn from(service: DiscoveredService) -> Self {
        Self {
            host: service.host,
            port: service.port,
            protocol: service.protocol,
            service_name: service.service_name,
            product: service.product,
            version: service.version,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskServicesResponse {
    pub task_id: i64,
    pub status: String,
    /// `xml` when read from the structured report, `text` when recovered
    /// from the raw output instead.
    pub source: String,
    pub services: Vec<ServiceResponse>,
    /// Set when the result is a best-effort read of the raw output.
    pub warning: Option<String>,
}

/// The service a follow-up targets, usually one entry from the services
/// endpoint.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FollowUpService {
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub service_name: String,
}

impl From<FollowUpService> for DiscoveredService {
    fn from(service: FollowUpService) -> Self {
        Self {
            protocol: service_protocol(&service.port, &service.service_name).to_owned(),
            host: service.host,
            port: service.port,
            service_name: service.service_name,
            product: String::new(),
            version: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FollowUpRequest {
    /// Tool id from the tool catalog.
    pub tool_id: String,
    pub service: FollowUpService,
    /// Option template; `{host}`, `{port}` and `{protocol}` are filled from
    /// `service`. The tool's default options are used when blank.
    #[serde(default)]
    pub options: String,
    /// Job priority in `0..=100`; higher runs first.
    #[serde(default)]
    pub priority: i64,
}
