//! taskd configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskdError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskdConfig {
    /// SQLite database holding tasks and executions. `~` is expanded.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Seconds between coordinator ticks in daemon mode.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum number of tasks claimed and dispatched per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Extra slack on top of a task's timeout before a `running` execution
    /// is considered orphaned.
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_db_path() -> String { "~/.taskd/tasks.db".into() }
fn default_tick_interval_secs() -> u64 { 60 }
fn default_batch_size() -> usize { 5 }
fn default_stale_grace_secs() -> u64 { 300 }

impl Default for TaskdConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tick_interval_secs: default_tick_interval_secs(),
            batch_size: default_batch_size(),
            stale_grace_secs: default_stale_grace_secs(),
            backoff: BackoffConfig::default(),
            executor: ExecutorConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl TaskdConfig {
    /// Load config from the default path (~/.taskd/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskdError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskdError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskdError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Reject values the coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(TaskdError::Config("tick_interval_secs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(TaskdError::Config("batch_size must be > 0".into()));
        }
        if self.backoff.multiplier < 1.0 || !self.backoff.multiplier.is_finite() {
            return Err(TaskdError::Config("backoff.multiplier must be a finite value >= 1".into()));
        }
        if self.backoff.max_delay_seconds < self.backoff.base_delay_seconds {
            return Err(TaskdError::Config(
                "backoff.max_delay_seconds must be >= backoff.base_delay_seconds".into(),
            ));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the taskd home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskd")
    }
}

/// Exponential retry backoff: `min(base * multiplier^n, max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_base_delay() -> u64 { 60 }
fn default_max_delay() -> u64 { 3600 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: default_base_delay(),
            max_delay_seconds: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

/// How task commands are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Shell used as `<shell> -c <command>`.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Working directory for commands. `~` is expanded.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Captured stdout/stderr are cut to this many bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Extra environment variables for every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shell() -> String { "sh".into() }
fn default_max_output_bytes() -> usize { 64 * 1024 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            workdir: None,
            max_output_bytes: default_max_output_bytes(),
            env: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn resolved_workdir(&self) -> Option<PathBuf> {
        self.workdir
            .as_deref()
            .map(|w| PathBuf::from(shellexpand::tilde(w).to_string()))
    }
}

/// Where operational notices (retry exhaustion, orphaned runs) are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Memory-store command, e.g. `["~/bin/memory.sh", "store"]`.
    /// The notice is appended as `<text> --type <kind> --tags <tags> --importance <n>`.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// HTTP endpoint receiving notices as JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn bool_true() -> bool { true }
fn default_notify_timeout_secs() -> u64 { 10 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            webhook_url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}
