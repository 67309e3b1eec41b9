//! Failure report: which tasks are failing, which tripped the circuit
//! breaker, and which have recovered.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskd_core::Result;

use crate::persistence::SchedulerDb;
use crate::tasks::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHealth {
    pub task_id: TaskId,
    pub name: String,
    pub consecutive_failures: u32,
    pub total_failures: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub generated_at: DateTime<Utc>,
    /// Currently failing: retries pending or exhausted.
    pub failing: Vec<TaskHealth>,
    /// Retries exhausted, waiting for `reset`.
    pub circuit_open: Vec<TaskHealth>,
    /// Failed at some point, healthy since.
    pub recovered: Vec<TaskHealth>,
}

impl FailureReport {
    pub fn build(db: &SchedulerDb, now: DateTime<Utc>) -> Result<Self> {
        let stats: HashMap<TaskId, _> = db
            .task_stats()?
            .into_iter()
            .map(|s| (s.task_id, s))
            .collect();

        let mut report = FailureReport {
            generated_at: now,
            failing: Vec::new(),
            circuit_open: Vec::new(),
            recovered: Vec::new(),
        };

        for task in db.list_tasks(false)? {
            let stat = stats.get(&task.id);
            let health = TaskHealth {
                task_id: task.id,
                name: task.name.clone(),
                consecutive_failures: task.retry_count,
                total_failures: stat.map(|s| s.failures).unwrap_or(0),
                last_failure_at: stat.and_then(|s| s.last_failure_at),
                last_success_at: task.last_success_at,
            };

            let exhausted = task.status == TaskStatus::Failed;
            if task.retry_count > 0 || exhausted {
                if exhausted {
                    report.circuit_open.push(health.clone());
                }
                report.failing.push(health);
            } else if health.last_success_at.is_some() && health.total_failures > 0 {
                report.recovered.push(health);
            }
        }
        Ok(report)
    }

    pub fn is_clean(&self) -> bool {
        self.failing.is_empty()
    }
}
