//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for scanbay-server.
///
/// Every field has a default so the server starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://scanbay.db"`).
    pub database_url: String,

    /// Directory that receives every task's raw and XML output.
    pub output_dir: PathBuf,

    /// Directory holding `tools.json` and `playbooks.json`.
    pub config_dir: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// How long the worker sleeps when the job queue is empty.
    pub poll_interval: Duration,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_openapi: bool,

    /// How long shutdown waits for the job in progress before giving up.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("SCANBAY_BIND", "0.0.0.0:3000"),
            database_url: env_or("SCANBAY_DATABASE_URL", "sqlite://scanbay.db"),
            output_dir: PathBuf::from(env_or("SCANBAY_OUTPUT_DIR", "output")),
            config_dir: PathBuf::from(env_or("SCANBAY_CONFIG_DIR", "config")),
            log_level: env_or("SCANBAY_LOG", "info"),
            log_json: env_flag("SCANBAY_LOG_JSON", false),
            poll_interval: Duration::from_millis(parse_env("SCANBAY_POLL_INTERVAL_MS", 2000)),
            enable_openapi: env_flag("SCANBAY_ENABLE_OPENAPI", true),
            shutdown_grace: Duration::from_secs(parse_env("SCANBAY_SHUTDOWN_GRACE_SECS", 10)),
        }
    }

    pub fn tools_path(&self) -> PathBuf {
        self.config_dir.join("tools.json")
    }

    pub fn playbooks_path(&self) -> PathBuf {
        self.config_dir.join("playbooks.json")
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_flag(&v).unwrap_or(default))
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
