//! # taskd scheduler
//!
//! SQLite-backed task scheduling and execution.
//!
//! ## Design
//! - Task definitions and the execution log live in one SQLite file
//! - "Currently running" is a row in the log, never in-process state, so a
//!   restart can reconcile what a crash left behind
//! - Select-and-claim is one immediate transaction: no double dispatch
//! - Commands are opaque; anything that can launch them implements
//!   [`CommandExecutor`]
//!
//! ## Architecture
//! ```text
//! Coordinator (tokio interval)
//!   ├── reconcile stale `running` executions (startup)
//!   ├── claim due tasks ── priority DESC, next_run_at ASC, dependency-gated
//!   ├── run up to batch_size concurrently, each under its timeout
//!   └── record outcome ──┬── success → next_run (once / recurring / cron)
//!                        ├── failure → retry with capped exponential backoff
//!                        └── exhausted → status = failed → NoticeRouter
//!                                                            ├── tracing
//!                                                            ├── memory-store command
//!                                                            └── webhook
//! ```

pub mod clock;
pub mod cron;
pub mod engine;
pub mod executor;
pub mod notify;
pub mod persistence;
pub mod report;
pub mod schedule;
pub mod tasks;
pub mod templates;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::CronExpr;
pub use engine::{Coordinator, TaskRun, TickReport, Transition, apply_outcome};
pub use executor::{CommandExecutor, ExecutionResult, ShellExecutor};
pub use notify::{Notice, NoticeRouter, NoticeSink};
pub use persistence::{Claim, FinishedRun, SchedulerDb, StaleRun, TaskStats};
pub use report::{FailureReport, TaskHealth};
pub use schedule::next_run;
pub use tasks::{
    Execution, ExecutionId, ExecutionStatus, MAX_SPAN_SECS, RetryPolicy, Schedule, Task,
    TaskCategory, TaskId, TaskStatus,
};
