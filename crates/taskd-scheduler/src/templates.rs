//! Starter tasks for a fresh store (`taskd init --seed`).

use chrono::{DateTime, Utc};
use taskd_core::Result;

use crate::persistence::SchedulerDb;
use crate::tasks::{Schedule, Task, TaskCategory};

/// A task definition without any runtime state.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub category: TaskCategory,
    pub command: &'static str,
    pub schedule: Schedule,
    pub priority: u8,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl TaskTemplate {
    pub fn to_task(&self, now: DateTime<Utc>) -> Task {
        let task = match &self.schedule {
            Schedule::Once => Task::once(self.name, self.command, now),
            Schedule::Recurring { interval_secs } => {
                Task::recurring(self.name, self.command, *interval_secs, now)
            }
            Schedule::Cron { expression } => Task::cron(self.name, self.command, expression, now),
        };
        Task {
            created_at: now,
            ..task
        }
        .with_description(self.description)
        .with_category(self.category)
        .with_priority(self.priority)
        .with_timeout(self.timeout_seconds)
        .with_max_retries(self.max_retries)
    }
}

pub fn default_templates() -> Vec<TaskTemplate> {
    vec![
        TaskTemplate {
            name: "Morning routine",
            description: "Review yesterday's notes and set goals for the day",
            category: TaskCategory::Custom,
            command: "~/bin/morning-routine.sh",
            schedule: Schedule::Cron { expression: "0 6 * * *".into() },
            priority: 9,
            timeout_seconds: 300,
            max_retries: 3,
        },
        TaskTemplate {
            name: "System health check",
            description: "CPU, memory and disk usage; flags anything over threshold",
            category: TaskCategory::Monitoring,
            command: "uptime && df -h / && (free -m 2>/dev/null || vm_stat)",
            schedule: Schedule::Recurring { interval_secs: 30 * 60 },
            priority: 7,
            timeout_seconds: 60,
            max_retries: 2,
        },
        TaskTemplate {
            name: "Memory cleanup",
            description: "Prune old temporary files and rotate state files",
            category: TaskCategory::Maintenance,
            command: "find \"${TMPDIR:-/tmp}\" -maxdepth 1 -name 'taskd-*' -mtime +7 -delete",
            schedule: Schedule::Cron { expression: "0 2 * * *".into() },
            priority: 4,
            timeout_seconds: 600,
            max_retries: 1,
        },
        TaskTemplate {
            name: "Git backup",
            description: "Commit and push the notes repository",
            category: TaskCategory::Maintenance,
            command: "cd ~/notes && git add -A && (git commit -qm 'nightly backup' || true) && git push -q",
            schedule: Schedule::Cron { expression: "0 23 * * *".into() },
            priority: 6,
            timeout_seconds: 300,
            max_retries: 3,
        },
        TaskTemplate {
            name: "Twitter engagement",
            description: "Check mentions and queue replies",
            category: TaskCategory::Social,
            command: "~/bin/twitter-engagement.sh",
            schedule: Schedule::Recurring { interval_secs: 15 * 60 },
            priority: 4,
            timeout_seconds: 300,
            max_retries: 3,
        },
    ]
}

/// Insert the default templates when the store has no tasks. Returns how
/// many were added.
pub fn seed_if_empty(db: &SchedulerDb, now: DateTime<Utc>) -> Result<usize> {
    if db.task_count()? > 0 {
        tracing::info!("📋 Store already has tasks, skipping templates");
        return Ok(0);
    }
    let templates = default_templates();
    for template in &templates {
        db.insert_task(&template.to_task(now))?;
    }
    Ok(templates.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_templates_are_valid() {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 5, 0, 0).unwrap();
        for template in default_templates() {
            let task = template.to_task(now);
            assert!(task.validate().is_ok(), "{} is invalid", template.name);
            assert!(task.next_run_at > now);
        }
    }

    #[test]
    fn test_seed_only_once() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 5, 0, 0).unwrap();
        assert_eq!(seed_if_empty(&db, now).unwrap(), 5);
        assert_eq!(seed_if_empty(&db, now).unwrap(), 0);

        let tasks = db.list_tasks(false).unwrap();
        assert_eq!(tasks.len(), 5);
        let morning = tasks.iter().find(|t| t.name == "Morning routine").unwrap();
        assert_eq!(morning.next_run_at, Utc.with_ymd_and_hms(2026, 4, 1, 6, 0, 0).unwrap());
    }
}
