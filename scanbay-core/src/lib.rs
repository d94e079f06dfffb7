//! Background execution core of scanbay: a durable job queue, a single
//! worker loop running allow-listed security tools as subprocesses, and a
//! playbook engine that turns a trigger scan's services into follow-up tasks.

pub mod catalog;
pub mod entities;
pub mod parser;
pub mod runtime;
pub mod validation;

pub use catalog::{CatalogError, PlaybookCatalog, PlaybookDefinition, ToolCatalog, ToolDefinition};
pub use entities::{
    JobId, JobKind, JobPayload, JobRecord, JobStatus, SqliteStore, TaskId, TaskRecord, TaskStatus,
};
pub use parser::{DiscoveredService, NmapXmlParser, ParseError, ServiceParser};
pub use runtime::Runtime;
pub use runtime::factory::{ProjectScan, QueuedTask, TaskCreateError, TaskFactory};
pub use runtime::playbook::{PlaybookEngine, PlaybookError, PlaybookReport};
pub use runtime::queue::{JobOutcome, JobQueue, QueueError};
pub use runtime::runner::{RunnerError, StopError, StopOutcome, TaskRunner};
pub use runtime::worker::{RecoveryReport, Worker, WorkerState};
pub use validation::ValidationError;
