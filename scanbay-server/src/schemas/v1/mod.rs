pub mod job;
pub mod playbook;
pub mod task;
pub mod tool;
