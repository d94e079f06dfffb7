pub mod job;
pub mod task;

pub use job::{JobId, JobKind, JobPayload, JobRecord, JobStatus, PayloadError};
pub use task::{NewTask, StopTransition, TaskId, TaskRecord, TaskStatus};
