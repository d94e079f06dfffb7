//! Durable storage for tasks, jobs and project targets.
//!
//! [`TaskStore`] and [`JobStore`] define the persistence interface the
//! runtime relies on. The only implementation is [`SqliteStore`]; every
//! state transition the runtime performs is a single conditional statement
//! (or a short write-locked transaction) against it, so nothing in memory is
//! authoritative across calls.
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` crate is required. [`TargetSource`] is the exception: the
//! playbook engine holds it as a trait object.

pub mod dao;
pub mod job;
pub mod target;
pub mod task;

pub use dao::{
    JobId, JobKind, JobPayload, JobRecord, JobStatus, NewTask, PayloadError, StopTransition,
    TaskId, TaskRecord, TaskStatus,
};

pub use job::JobStore;
pub use target::TargetSource;
pub use task::TaskStore;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// SQLite-backed store shared by the worker loop and HTTP handlers.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g. `"sqlite://scanbay.db"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options).await
    }

    /// Open the database described by `options`.
    ///
    /// WAL mode and a busy timeout let the HTTP side read while the worker
    /// holds a write lock.
    pub async fn connect_with(options: SqliteConnectOptions) -> Result<Self, sqlx::Error> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ── timestamp helpers ────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that lexical order in SQL matches time order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_timestamp() -> String {
    timestamp(Utc::now())
}

pub(crate) fn parse_timestamp(raw: &str, column: &'static str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        tracing::warn!(raw = %raw, column, error = %e, "failed to parse stored timestamp; using now");
        Utc::now()
    })
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<String>,
    column: &'static str,
) -> Option<DateTime<Utc>> {
    raw.map(|r| parse_timestamp(&r, column))
}
