//! Task definitions: the data model for scheduled work.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskd_core::{BackoffConfig, Result, TaskdError};

use crate::cron::CronExpr;
use crate::schedule;

pub type TaskId = i64;
pub type ExecutionId = i64;

/// Upper bound for `timeout_seconds` and recurring intervals: ten years.
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 86_400;

/// A scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Row id; 0 until the task has been inserted.
    pub id: TaskId,
    /// Human-readable name, not unique.
    pub name: String,
    pub description: Option<String>,
    pub category: TaskCategory,
    /// Opaque command handed to the executor.
    pub command: String,
    pub schedule: Schedule,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// 1–10, higher runs first.
    pub priority: u8,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout_seconds: u64,
    /// Task whose successful run gates this one.
    pub depends_on: Option<TaskId>,
    /// Soft-delete flag, independent of `status`.
    pub is_active: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// When/how the task triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run once, never rescheduled.
    Once,
    /// Run every N seconds.
    Recurring { interval_secs: u64 },
    /// Run on a five-field cron expression (UTC).
    Cron { expression: String },
}

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Once => "once",
            Schedule::Recurring { .. } => "recurring",
            Schedule::Cron { .. } => "cron",
        }
    }

    /// Strict check used when a task is defined. The runtime calculator is
    /// lenient and falls back to a daily cadence instead.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Once => Ok(()),
            Schedule::Recurring { interval_secs } => {
                if *interval_secs == 0 {
                    Err(TaskdError::InvalidSchedule("recurring interval must be > 0".into()))
                } else if *interval_secs > MAX_SPAN_SECS {
                    Err(TaskdError::InvalidSchedule(format!(
                        "recurring interval must be at most {MAX_SPAN_SECS}s, got {interval_secs}s"
                    )))
                } else {
                    Ok(())
                }
            }
            Schedule::Cron { expression } => {
                let cron = CronExpr::parse(expression)?;
                // Parses but matches no real date, e.g. Feb 30.
                if cron.next_after(Utc::now()).is_none() {
                    return Err(TaskdError::InvalidSchedule(format!(
                        "cron '{}' never fires",
                        cron.source()
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Once => write!(f, "once"),
            Schedule::Recurring { interval_secs } => write!(f, "every {}", human_secs(*interval_secs)),
            Schedule::Cron { expression } => write!(f, "cron '{expression}'"),
        }
    }
}

fn human_secs(secs: u64) -> String {
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Task status. Only `Active` tasks are ever selected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    /// Retries exhausted; needs an operator reset.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = TaskdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskdError::InvalidTask(format!("unknown task status '{other}'"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of task categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Monitoring,
    Social,
    Financial,
    Maintenance,
    Custom,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Monitoring => "monitoring",
            TaskCategory::Social => "social",
            TaskCategory::Financial => "financial",
            TaskCategory::Maintenance => "maintenance",
            TaskCategory::Custom => "custom",
        }
    }
}

impl FromStr for TaskCategory {
    type Err = TaskdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "monitoring" => Ok(TaskCategory::Monitoring),
            "social" => Ok(TaskCategory::Social),
            "financial" => Ok(TaskCategory::Financial),
            "maintenance" => Ok(TaskCategory::Maintenance),
            "custom" => Ok(TaskCategory::Custom),
            other => Err(TaskdError::InvalidTask(format!(
                "unknown category '{other}' (expected monitoring, social, financial, maintenance or custom)"
            ))),
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Task {
    fn base(name: &str, command: &str, schedule: Schedule, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            description: None,
            category: TaskCategory::Custom,
            command: command.to_string(),
            schedule,
            next_run_at,
            last_run_at: None,
            last_success_at: None,
            status: TaskStatus::Active,
            priority: 5,
            max_retries: 3,
            retry_count: 0,
            timeout_seconds: 300,
            depends_on: None,
            is_active: true,
            metadata: serde_json::json!({}),
            created_at: now,
        }
    }

    /// Create a one-off task due at `at`.
    pub fn once(name: &str, command: &str, at: DateTime<Utc>) -> Self {
        Self::base(name, command, Schedule::Once, at, Utc::now())
    }

    /// Create a recurring task, first due one interval after `now`.
    pub fn recurring(name: &str, command: &str, interval_secs: u64, now: DateTime<Utc>) -> Self {
        // Out-of-range intervals never come due; `validate` rejects them.
        let next = schedule::checked_add_secs(now, interval_secs).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::base(name, command, Schedule::Recurring { interval_secs }, next, now)
    }

    /// Create a cron-scheduled task, first due at the next match after `now`.
    pub fn cron(name: &str, command: &str, expression: &str, now: DateTime<Utc>) -> Self {
        let schedule = Schedule::Cron {
            expression: expression.to_string(),
        };
        let next = schedule::next_run(&schedule, now, now).unwrap_or(now);
        Self::base(name, command, schedule, next, now)
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_dependency(mut self, depends_on: TaskId) -> Self {
        self.depends_on = Some(depends_on);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = at;
        self
    }

    /// Check the definition before it is stored.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TaskdError::InvalidTask("name must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(TaskdError::InvalidTask("command must not be empty".into()));
        }
        if !(1..=10).contains(&self.priority) {
            return Err(TaskdError::InvalidTask(format!(
                "priority must be between 1 and 10, got {}",
                self.priority
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(TaskdError::InvalidTask("timeout_seconds must be > 0".into()));
        }
        if self.timeout_seconds > MAX_SPAN_SECS {
            return Err(TaskdError::InvalidTask(format!(
                "timeout_seconds must be at most {MAX_SPAN_SECS}, got {}",
                self.timeout_seconds
            )));
        }
        if self.id != 0 && self.depends_on == Some(self.id) {
            return Err(TaskdError::InvalidTask("a task cannot depend on itself".into()));
        }
        if !self.metadata.is_object() {
            return Err(TaskdError::InvalidTask("metadata must be a JSON object".into()));
        }
        self.schedule.validate()
    }
}

/// Exponential backoff between retries of a failed occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for RetryPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay_seconds: config.base_delay_seconds,
            max_delay_seconds: config.max_delay_seconds,
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay after `failures` consecutive failures: `base * multiplier^failures`,
    /// never more than `max_delay_seconds` (nor [`MAX_SPAN_SECS`]).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(i32::MAX as u32) as i32;
        let raw = self.base_delay_seconds as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay_seconds as f64;
        let secs = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::seconds(secs.clamp(0.0, MAX_SPAN_SECS as f64) as i64)
    }
}

/// Outcome of one execution attempt as recorded in the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = TaskdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(TaskdError::InvalidTask(format!("unknown execution status '{other}'"))),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to run a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_recurring_first_run() {
        let task = Task::recurring("check", "true", 1800, at(10, 0));
        assert_eq!(task.next_run_at, at(10, 30));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_cron_first_run() {
        let task = Task::cron("morning", "true", "0 6 * * *", at(5, 0));
        assert_eq!(task.next_run_at, at(6, 0));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let now = at(9, 0);
        assert!(Task::recurring("x", "true", 60, now).with_priority(0).validate().is_err());
        assert!(Task::recurring("x", "true", 60, now).with_priority(11).validate().is_err());
        assert!(Task::recurring("x", "  ", 60, now).validate().is_err());
        assert!(Task::recurring("x", "true", 60, now).with_timeout(0).validate().is_err());
        assert!(Task::recurring("x", "true", 0, now).validate().is_err());
        assert!(Task::cron("x", "true", "61 * * * *", now).validate().is_err());
        assert!(
            Task::recurring("x", "true", 60, now)
                .with_metadata(serde_json::json!([1, 2]))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validate_bounds_spans() {
        let now = at(9, 0);
        let huge = 10_000_000_000_000;
        // Must not panic on overflow; the definition is rejected instead.
        let task = Task::recurring("x", "true", huge, now);
        assert!(matches!(task.validate(), Err(TaskdError::InvalidSchedule(_))));
        assert!(matches!(
            Task::once("x", "true", now).with_timeout(huge).validate(),
            Err(TaskdError::InvalidTask(_))
        ));
        assert!(Task::recurring("x", "true", MAX_SPAN_SECS, now).validate().is_ok());
        assert!(Task::once("x", "true", now).with_timeout(MAX_SPAN_SECS).validate().is_ok());
        assert!(Task::recurring("x", "true", u64::MAX, now).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cron_that_never_fires() {
        let now = at(9, 0);
        let feb30 = Task::cron("feb30", "true", "0 0 30 2 *", now);
        assert!(matches!(feb30.validate(), Err(TaskdError::InvalidSchedule(_))));
        assert!(Task::cron("leap", "true", "0 0 29 2 *", now).validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::seconds(60));
        assert_eq!(policy.delay(1), Duration::seconds(120));
        assert_eq!(policy.delay(5), Duration::seconds(1920));
        assert_eq!(policy.delay(6), Duration::seconds(3600));
        assert_eq!(policy.delay(u32::MAX), Duration::seconds(3600));
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        let policy = RetryPolicy {
            base_delay_seconds: 7,
            max_delay_seconds: 500,
            multiplier: 3.5,
        };
        for attempt in (0..200).chain([1_000, 100_000, u32::MAX]) {
            assert!(policy.delay(attempt) <= Duration::seconds(500));
        }
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert_eq!("Social".parse::<TaskCategory>().unwrap(), TaskCategory::Social);
        assert!("weather".parse::<TaskCategory>().is_err());
    }
}
