//! Typed configuration.
//!
//! Host-level values come from environment variables and are loaded once at
//! startup. Per-worker settings come from a TOML file with one
//! `[workers.<Name>]` table per worker.

pub mod secrets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::throttle::DEFAULT_GROUP;

#[derive(Debug)]
pub struct Config {
    /// Postgres state store. In-memory state when unset.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub workers_file: PathBuf,
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let shutdown_timeout = match std::env::var("SHUTDOWN_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                Error::Config(format!("SHUTDOWN_TIMEOUT_SECS is not a number: {raw}"))
            })?),
            Err(_) => Duration::from_secs(60),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workers_file: std::env::var("WORKERS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("workers.toml")),
            shutdown_timeout,
        })
    }
}

// ---------------------------------------------------------------------------
// Worker settings
// ---------------------------------------------------------------------------

/// Per-worker settings. Immutable once a worker is built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Disabled workers are never scheduled.
    pub enabled: bool,
    pub concurrent_task_count: usize,
    /// Pause between sessions, in seconds.
    pub idle_time_secs: u64,
    /// Workers sharing a group never fetch concurrently.
    pub resource_group: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrent_task_count: 1,
            idle_time_secs: 12 * 60 * 60,
            resource_group: DEFAULT_GROUP.to_string(),
        }
    }
}

impl WorkerSettings {
    pub fn idle_time(&self) -> Duration {
        Duration::from_secs(self.idle_time_secs)
    }

    pub fn validate(&self, worker: &str) -> Result<()> {
        if self.concurrent_task_count == 0 {
            return Err(Error::Config(format!(
                "worker {worker}: concurrent_task_count must be at least 1"
            )));
        }
        if self.resource_group.trim().is_empty() {
            return Err(Error::Config(format!(
                "worker {worker}: resource_group must not be empty"
            )));
        }
        Ok(())
    }

    pub fn concurrent_task_count(mut self, n: usize) -> Self {
        self.concurrent_task_count = n;
        self
    }

    pub fn idle_time_secs(mut self, secs: u64) -> Self {
        self.idle_time_secs = secs;
        self
    }

    pub fn resource_group(mut self, group: impl Into<String>) -> Self {
        self.resource_group = group.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    workers: HashMap<String, WorkerSettings>,
}

impl WorkersConfig {
    /// Read and validate a workers file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read workers config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad workers config {}: {e}", path.display())))
    }

    /// Like [`load`](Self::load), but a missing file means "all defaults".
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        for (name, settings) in &config.workers {
            settings.validate(name)?;
        }
        Ok(config)
    }

    /// Effective settings for `worker`: the file's table or the defaults,
    /// then `WORKERS_<NAME>_ENABLED` from the environment if set.
    pub fn settings_for(&self, worker: &str) -> Result<WorkerSettings> {
        let mut settings = self.workers.get(worker).cloned().unwrap_or_default();
        if let Some(enabled) = enabled_override(worker)? {
            settings.enabled = enabled;
        }
        Ok(settings)
    }

    /// Names of every worker with a table in the file.
    pub fn worker_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn enabled_override(worker: &str) -> Result<Option<bool>> {
    let var = format!("WORKERS_{}_ENABLED", worker.to_uppercase());
    match std::env::var(&var) {
        Ok(raw) => raw
            .trim()
            .parse::<bool>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{var} must be true or false, got {raw}"))),
        Err(_) => Ok(None),
    }
}
