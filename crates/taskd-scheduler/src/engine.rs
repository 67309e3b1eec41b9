//! Execution coordinator: claims due tasks, runs them concurrently under
//! their timeouts, records the outcome and reschedules.
//!
//! One tick is: claim (atomic) → run up to `batch_size` commands at once →
//! write each terminal execution together with the task's new state. The
//! daemon loop repeats this on a fixed interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use taskd_core::{Result, TaskdConfig};

use crate::clock::{Clock, SystemClock};
use crate::executor::{CommandExecutor, ExecutionResult};
use crate::notify::{Notice, NoticeRouter};
use crate::persistence::{Claim, FinishedRun, SchedulerDb};
use crate::schedule;
use crate::tasks::{ExecutionId, ExecutionStatus, RetryPolicy, Task, TaskId, TaskStatus};

/// How a single invocation ended, before it is written to the log.
#[derive(Debug)]
enum RunOutcome {
    Success(ExecutionResult),
    Failed(ExecutionResult),
    LaunchFailed(String),
    TimedOut(Duration),
    Cancelled,
}

impl RunOutcome {
    fn status(&self) -> ExecutionStatus {
        match self {
            RunOutcome::Success(_) => ExecutionStatus::Success,
            RunOutcome::Failed(_) | RunOutcome::LaunchFailed(_) => ExecutionStatus::Failed,
            RunOutcome::TimedOut(_) => ExecutionStatus::Timeout,
            RunOutcome::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

/// What happened to the task row after an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Succeeded; next occurrence scheduled.
    Rescheduled { next_run_at: DateTime<Utc> },
    /// Succeeded and the schedule has no next occurrence.
    Completed,
    /// Failed; retry number `attempt` scheduled after `delay`.
    RetryScheduled { attempt: u32, delay: chrono::Duration },
    /// Failed with no retries left; the task is now `failed`.
    Exhausted { attempts: u32 },
}

/// New task state after a finished (not cancelled) execution that was
/// dispatched at `started_at` and ended at `now`.
///
/// `last_run_at` records the dispatch time, so an upstream success that lands
/// while this task is still running satisfies its next dependency check.
pub fn apply_outcome(
    task: &Task,
    succeeded: bool,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> (Task, Transition) {
    let mut next = task.clone();
    next.last_run_at = Some(started_at);

    if succeeded {
        next.last_success_at = Some(now);
        next.retry_count = 0;
        let transition = match schedule::next_run(&task.schedule, now, now) {
            Some(at) => {
                next.next_run_at = at;
                Transition::Rescheduled { next_run_at: at }
            }
            None => {
                next.status = TaskStatus::Completed;
                Transition::Completed
            }
        };
        return (next, transition);
    }

    next.retry_count = task.retry_count.saturating_add(1);
    if next.retry_count >= task.max_retries {
        next.status = TaskStatus::Failed;
        let attempts = next.retry_count;
        (next, Transition::Exhausted { attempts })
    } else {
        let delay = policy.delay(next.retry_count);
        next.next_run_at = now + delay;
        let attempt = next.retry_count;
        (next, Transition::RetryScheduled { attempt, delay })
    }
}

/// Result of one dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub task_name: String,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    /// `None` for cancelled runs, or when the execution had already been
    /// closed by stale reconciliation.
    pub transition: Option<Transition>,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub runs: Vec<TaskRun>,
}

impl TickReport {
    pub fn claimed(&self) -> usize {
        self.runs.len()
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    /// Failed plus timed out.
    pub fn failures(&self) -> usize {
        self.count(ExecutionStatus::Failed) + self.count(ExecutionStatus::Timeout)
    }
}

pub struct Coordinator {
    db: Arc<SchedulerDb>,
    executor: Arc<dyn CommandExecutor>,
    clock: Arc<dyn Clock>,
    notices: NoticeRouter,
    retry: RetryPolicy,
    batch_size: usize,
    tick_interval: Duration,
    stale_grace_secs: u64,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(db: Arc<SchedulerDb>, executor: Arc<dyn CommandExecutor>, config: &TaskdConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            executor,
            clock: Arc::new(SystemClock),
            notices: NoticeRouter::from_config(&config.notify),
            retry: RetryPolicy::from(&config.backoff),
            batch_size: config.batch_size.max(1),
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            stale_grace_secs: config.stale_grace_secs,
            shutdown_tx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notices(mut self, notices: NoticeRouter) -> Self {
        self.notices = notices;
        self
    }

    pub fn db(&self) -> &SchedulerDb {
        &self.db
    }

    pub fn notices(&self) -> &NoticeRouter {
        &self.notices
    }

    /// Ask the coordinator to stop. Running commands are killed and their
    /// executions recorded as `cancelled`.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!("🛑 Shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Close out executions left `running` by a previous process.
    pub async fn reconcile(&self) -> Result<usize> {
        let stale = self.db.reconcile_stale(self.clock.now(), self.stale_grace_secs)?;
        for run in &stale {
            self.notices
                .publish(Notice::new(
                    format!(
                        "Task '{}' execution #{} (started {}) was orphaned and marked failed",
                        run.task_name,
                        run.execution_id,
                        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    "task_orphaned",
                    &["scheduler", "recovery"],
                    6,
                ))
                .await;
        }
        Ok(stale.len())
    }

    /// Claim and run whatever is due now. A store error aborts the tick;
    /// individual task failures never do.
    pub async fn tick(&self) -> Result<TickReport> {
        if self.is_shutting_down() {
            return Ok(TickReport::default());
        }
        let claims = self.db.claim_due_tasks(self.clock.now(), self.batch_size)?;
        if claims.is_empty() {
            tracing::debug!("No tasks due");
            return Ok(TickReport::default());
        }
        tracing::info!("🔔 {} task(s) due", claims.len());

        let results = join_all(claims.into_iter().map(|claim| self.dispatch(claim))).await;
        let mut report = TickReport::default();
        for result in results {
            report.runs.push(result?);
        }

        let failures = report.failures();
        if failures > 0 {
            let names: Vec<&str> = report
                .runs
                .iter()
                .filter(|r| matches!(r.status, ExecutionStatus::Failed | ExecutionStatus::Timeout))
                .map(|r| r.task_name.as_str())
                .collect();
            self.notices
                .publish(Notice::new(
                    format!(
                        "Scheduler tick: {failures} of {} task(s) failed ({})",
                        report.claimed(),
                        names.join(", ")
                    ),
                    "tick_summary",
                    &["scheduler"],
                    5,
                ))
                .await;
        }
        Ok(report)
    }

    /// Daemon loop: reconcile once, then tick every `tick_interval_secs`
    /// until [`Coordinator::shutdown`] is called. Returns early only on a
    /// store error.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "⏰ Coordinator started (tick every {}s, batch {})",
            self.tick_interval.as_secs(),
            self.batch_size
        );
        let reconciled = self.reconcile().await?;
        if reconciled > 0 {
            tracing::warn!("🧹 Reconciled {reconciled} orphaned execution(s)");
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            let report = self.tick().await?;
            if report.claimed() > 0 {
                tracing::info!(
                    "✅ Tick done: {} ok, {} failed, {} timed out, {} cancelled",
                    report.count(ExecutionStatus::Success),
                    report.count(ExecutionStatus::Failed),
                    report.count(ExecutionStatus::Timeout),
                    report.count(ExecutionStatus::Cancelled)
                );
            }
            if self.is_shutting_down() {
                break;
            }
        }

        tracing::info!("🛑 Coordinator stopped");
        Ok(())
    }

    /// Run one claimed task, racing its timeout and the shutdown signal.
    async fn dispatch(&self, claim: Claim) -> Result<TaskRun> {
        let task = &claim.task;
        tracing::info!(
            "▶️ Running '{}' (#{}, execution #{})",
            task.name,
            task.id,
            claim.execution_id
        );

        let limit = Duration::from_secs(task.timeout_seconds);
        let mut shutdown = self.shutdown_tx.subscribe();
        let outcome = tokio::select! {
            res = tokio::time::timeout(limit, self.executor.execute(&task.command)) => match res {
                Ok(Ok(result)) if result.success() => RunOutcome::Success(result),
                Ok(Ok(result)) => RunOutcome::Failed(result),
                Ok(Err(e)) => RunOutcome::LaunchFailed(e.to_string()),
                Err(_) => RunOutcome::TimedOut(limit),
            },
            _ = shutdown.wait_for(|stop| *stop) => RunOutcome::Cancelled,
        };

        self.record(claim, outcome).await
    }

    /// Write the terminal execution and the task's new state.
    async fn record(&self, claim: Claim, outcome: RunOutcome) -> Result<TaskRun> {
        let now = self.clock.now();
        let status = outcome.status();
        let (exit_code, output, error) = match &outcome {
            RunOutcome::Success(r) | RunOutcome::Failed(r) => (
                r.exit_code,
                non_empty(&r.stdout),
                non_empty(&r.stderr),
            ),
            RunOutcome::LaunchFailed(e) => (None, None, Some(e.clone())),
            RunOutcome::TimedOut(limit) => (
                None,
                None,
                Some(format!("timed out after {}s", limit.as_secs())),
            ),
            RunOutcome::Cancelled => (None, None, Some("cancelled by shutdown".to_string())),
        };

        let finished = FinishedRun {
            execution_id: claim.execution_id,
            status,
            started_at: claim.started_at,
            completed_at: now,
            exit_code,
            output,
            error,
        };

        let task = &claim.task;
        let transition = if status == ExecutionStatus::Cancelled {
            // No retry charged; the task stays due.
            if !self.db.complete_execution(&finished, None)? {
                tracing::warn!("Execution #{} was already closed", claim.execution_id);
            }
            tracing::info!("⏹️ '{}' cancelled", task.name);
            None
        } else {
            let (updated, transition) = apply_outcome(
                task,
                status == ExecutionStatus::Success,
                claim.started_at,
                now,
                &self.retry,
            );
            if self.db.complete_execution(&finished, Some(&updated))? {
                self.log_transition(task, status, &transition).await;
                Some(transition)
            } else {
                tracing::warn!(
                    "Execution #{} of '{}' was already closed, result dropped",
                    claim.execution_id,
                    task.name
                );
                None
            }
        };

        Ok(TaskRun {
            task_id: task.id,
            task_name: task.name.clone(),
            execution_id: claim.execution_id,
            status,
            transition,
        })
    }

    async fn log_transition(&self, task: &Task, status: ExecutionStatus, transition: &Transition) {
        match transition {
            Transition::Rescheduled { next_run_at } => {
                tracing::info!("✅ '{}' succeeded, next run {}", task.name, next_run_at);
            }
            Transition::Completed => {
                tracing::info!("✅ '{}' succeeded and is complete", task.name);
            }
            Transition::RetryScheduled { attempt, delay } => {
                tracing::warn!(
                    "⚠️ '{}' {status}, retry {attempt}/{} in {}s",
                    task.name,
                    task.max_retries,
                    delay.num_seconds()
                );
            }
            Transition::Exhausted { attempts } => {
                tracing::error!("❌ '{}' {status}, giving up after {attempts} attempt(s)", task.name);
                self.notices
                    .publish(Notice::new(
                        format!(
                            "CRITICAL: Task '{}' failed after all retries ({attempts} attempts); status set to failed until reset",
                            task.name
                        ),
                        "task_failure",
                        &["scheduler", "error", "critical"],
                        8,
                    ))
                    .await;
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}
