//! # taskd
//!
//! Command-line front end for the scheduler.
//!
//! Usage:
//!   taskd init --seed          # Create the schema and starter tasks
//!   taskd run                  # Execute one tick (for cron / launchd)
//!   taskd daemon               # Tick forever until Ctrl+C
//!   taskd list                 # Active tasks
//!   taskd status --limit 20    # Recent executions

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taskd_core::TaskdConfig;
use taskd_scheduler::{
    Coordinator, ExecutionStatus, FailureReport, SchedulerDb, ShellExecutor, Task, TaskCategory,
    TaskHealth, TaskStatus, TickReport, templates,
};

#[derive(Parser)]
#[command(name = "taskd", version, about = "⏰ taskd: SQLite-backed task scheduler")]
struct Cli {
    /// Config file (default: ~/.taskd/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init {
        /// Add the starter task templates if the store is empty
        #[arg(long)]
        seed: bool,
    },
    /// Run a single scheduler tick
    Run,
    /// Run the scheduler loop until interrupted
    Daemon,
    /// List tasks
    List {
        /// Include removed tasks
        #[arg(long)]
        all: bool,
    },
    /// Show recent executions
    Status {
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Only this task
        #[arg(long)]
        task: Option<i64>,
    },
    /// Define a new task (runs once, now, unless a schedule is given)
    Add {
        name: String,
        /// Shell command to run
        command: String,
        /// Repeat every N seconds
        #[arg(long, conflicts_with_all = ["cron", "at"])]
        every: Option<u64>,
        /// Five-field cron expression (UTC)
        #[arg(long, conflicts_with = "at")]
        cron: Option<String>,
        /// Run once at this RFC 3339 time
        #[arg(long)]
        at: Option<String>,
        #[arg(long, default_value = "custom")]
        category: String,
        #[arg(long, default_value = "5")]
        priority: u8,
        #[arg(long, default_value = "3")]
        max_retries: u32,
        /// Timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
        /// Only run after this task's latest run succeeded
        #[arg(long)]
        depends_on: Option<i64>,
        #[arg(long)]
        description: Option<String>,
        /// JSON object stored with the task
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Re-activate a failed task and clear its retry counter
    Reset { id: i64 },
    /// Stop selecting a task
    Pause { id: i64 },
    /// Resume a paused task
    Resume { id: i64 },
    /// Remove a task (history is kept)
    Remove { id: i64 },
    /// Per-task execution statistics
    Stats,
    /// Failing, circuit-open and recovered tasks
    Report {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskd=debug,taskd_scheduler=debug,taskd_core=debug"
    } else {
        "taskd=info,taskd_scheduler=info,taskd_core=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = match &cli.config {
        Some(path) => TaskdConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TaskdConfig::load()?,
    };
    let db_path = cli.db.clone().unwrap_or_else(|| config.resolved_db_path());
    tracing::debug!("Using database {}", db_path.display());

    match cli.command {
        Commands::Init { seed } => {
            let db = SchedulerDb::open(&db_path)?;
            println!("✅ Database ready: {}", db_path.display());
            if cli.config.is_none() && !TaskdConfig::default_path().exists() {
                config.save()?;
                println!("📝 Wrote default config: {}", TaskdConfig::default_path().display());
            }
            if seed {
                let added = templates::seed_if_empty(&db, Utc::now())?;
                if added > 0 {
                    println!("📋 Added {added} starter task(s)");
                } else {
                    println!("📋 Store already has tasks, nothing seeded");
                }
            }
        }
        Commands::Run => {
            let coordinator = Arc::new(build_coordinator(&db_path, &config)?);
            spawn_ctrl_c(coordinator.clone());
            let reconciled = coordinator.reconcile().await?;
            if reconciled > 0 {
                println!("🧹 Reconciled {reconciled} orphaned execution(s)");
            }
            let report = coordinator.tick().await?;
            print_tick(&report);
        }
        Commands::Daemon => {
            let coordinator = Arc::new(build_coordinator(&db_path, &config)?);
            spawn_ctrl_c(coordinator.clone());
            if let Err(e) = coordinator.run().await {
                if e.is_store() {
                    tracing::error!("❌ Task store failed, daemon stopping: {e}");
                    return Err(e).with_context(|| format!("task store {}", db_path.display()));
                }
                return Err(e.into());
            }
        }
        Commands::List { all } => {
            let db = SchedulerDb::open(&db_path)?;
            print_tasks(&db.list_tasks(all)?);
        }
        Commands::Status { limit, task } => {
            let db = SchedulerDb::open(&db_path)?;
            let executions = db.recent_executions(limit, task)?;
            if executions.is_empty() {
                println!("No executions recorded.");
                return Ok(());
            }
            println!(
                "{:>6}  {:>5}  {:<10}  {:<20}  {:>9}  {:>4}  {}",
                "EXEC", "TASK", "STATUS", "STARTED", "DURATION", "EXIT", "ERROR"
            );
            for e in executions {
                println!(
                    "{:>6}  {:>5}  {:<10}  {:<20}  {:>9}  {:>4}  {}",
                    e.id,
                    e.task_id,
                    status_icon(e.status),
                    fmt_time(Some(e.started_at)),
                    e.execution_time_ms
                        .map(|ms| format!("{ms}ms"))
                        .unwrap_or_else(|| "-".into()),
                    e.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    e.error.as_deref().map(first_line).unwrap_or_default()
                );
            }
        }
        Commands::Add {
            name,
            command,
            every,
            cron,
            at,
            category,
            priority,
            max_retries,
            timeout,
            depends_on,
            description,
            metadata,
        } => {
            let now = Utc::now();
            let mut task = match (every, cron, at) {
                (Some(secs), _, _) => Task::recurring(&name, &command, secs, now),
                (None, Some(expr), _) => Task::cron(&name, &command, &expr, now),
                (None, None, Some(at)) => {
                    let at = DateTime::parse_from_rfc3339(&at)
                        .with_context(|| format!("invalid --at time '{at}'"))?
                        .with_timezone(&Utc);
                    Task::once(&name, &command, at)
                }
                (None, None, None) => Task::once(&name, &command, now),
            };
            task = task
                .with_category(category.parse::<TaskCategory>()?)
                .with_priority(priority)
                .with_max_retries(max_retries)
                .with_timeout(timeout);
            if let Some(dep) = depends_on {
                task = task.with_dependency(dep);
            }
            if let Some(description) = description {
                task = task.with_description(&description);
            }
            if let Some(metadata) = metadata {
                let value: serde_json::Value =
                    serde_json::from_str(&metadata).context("--metadata must be JSON")?;
                task = task.with_metadata(value);
            }

            let db = SchedulerDb::open(&db_path)?;
            let id = db.insert_task(&task)?;
            println!(
                "✅ Task #{id} '{}' ({}), next run {}",
                task.name,
                task.schedule,
                fmt_time(Some(task.next_run_at))
            );
        }
        Commands::Reset { id } => {
            let db = SchedulerDb::open(&db_path)?;
            db.reset_task(id, Utc::now())?;
            println!("🔄 Task #{id} reset and due now");
        }
        Commands::Pause { id } => {
            let db = SchedulerDb::open(&db_path)?;
            db.set_status(id, TaskStatus::Paused)?;
            println!("⏸️  Task #{id} paused");
        }
        Commands::Resume { id } => {
            let db = SchedulerDb::open(&db_path)?;
            let task = db.get_task(id)?;
            if task.status != TaskStatus::Paused {
                anyhow::bail!("task #{id} is {}, not paused", task.status);
            }
            db.set_status(id, TaskStatus::Active)?;
            println!("▶️  Task #{id} resumed");
        }
        Commands::Remove { id } => {
            let db = SchedulerDb::open(&db_path)?;
            db.set_active(id, false)?;
            println!("🗑️  Task #{id} removed");
        }
        Commands::Stats => {
            let db = SchedulerDb::open(&db_path)?;
            println!(
                "{:>5}  {:<32}  {:>5}  {:>5}  {:>6}  {:>9}  {}",
                "ID", "NAME", "RUNS", "OK", "FAILED", "AVG", "LAST COMPLETED"
            );
            for s in db.task_stats()? {
                println!(
                    "{:>5}  {:<32}  {:>5}  {:>5}  {:>6}  {:>9}  {}",
                    s.task_id,
                    truncate(&s.name, 32),
                    s.total_runs,
                    s.successes,
                    s.failures,
                    s.avg_execution_ms
                        .map(|ms| format!("{ms:.0}ms"))
                        .unwrap_or_else(|| "-".into()),
                    fmt_time(s.last_completed_at)
                );
            }
        }
        Commands::Report { json } => {
            let db = SchedulerDb::open(&db_path)?;
            let report = FailureReport::build(&db, Utc::now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn build_coordinator(db_path: &std::path::Path, config: &TaskdConfig) -> Result<Coordinator> {
    let db = Arc::new(SchedulerDb::open(db_path)?);
    let executor = Arc::new(ShellExecutor::new(&config.executor));
    Ok(Coordinator::new(db, executor, config))
}

fn spawn_ctrl_c(coordinator: Arc<Coordinator>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            coordinator.shutdown();
        }
    });
}

fn print_tick(report: &TickReport) {
    if report.claimed() == 0 {
        println!("No tasks due.");
        return;
    }
    for run in &report.runs {
        println!(
            "{}  #{:<5} {}",
            status_icon(run.status),
            run.task_id,
            run.task_name
        );
    }
    println!(
        "\n{} run: {} ok, {} failed, {} timed out, {} cancelled",
        report.claimed(),
        report.count(ExecutionStatus::Success),
        report.count(ExecutionStatus::Failed),
        report.count(ExecutionStatus::Timeout),
        report.count(ExecutionStatus::Cancelled)
    );
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    println!(
        "{:>5}  {:<28}  {:<11}  {:<20}  {:>3}  {:<10}  {:<20}  {}",
        "ID", "NAME", "CATEGORY", "SCHEDULE", "PRI", "STATUS", "NEXT RUN", "RETRIES"
    );
    for t in tasks {
        let status = if t.is_active {
            t.status.to_string()
        } else {
            "removed".to_string()
        };
        println!(
            "{:>5}  {:<28}  {:<11}  {:<20}  {:>3}  {:<10}  {:<20}  {}/{}",
            t.id,
            truncate(&t.name, 28),
            t.category,
            truncate(&t.schedule.to_string(), 20),
            t.priority,
            status,
            fmt_time(Some(t.next_run_at)),
            t.retry_count,
            t.max_retries
        );
    }
}

fn print_report(report: &FailureReport) {
    println!("📊 Failure report ({})", fmt_time(Some(report.generated_at)));
    if report.is_clean() && report.recovered.is_empty() {
        println!("   All tasks healthy.");
        return;
    }
    let section = |title: &str, rows: &[TaskHealth]| {
        if rows.is_empty() {
            return;
        }
        println!("\n{title}");
        for h in rows {
            println!(
                "   #{:<5} {:<32} consecutive {:>2}, total {:>3}, last failure {}, last success {}",
                h.task_id,
                truncate(&h.name, 32),
                h.consecutive_failures,
                h.total_failures,
                fmt_time(h.last_failure_at),
                fmt_time(h.last_success_at)
            );
        }
    };
    section("❌ Failing", &report.failing);
    section("🚨 Circuit open (needs `taskd reset`)", &report.circuit_open);
    section("✅ Recovered", &report.recovered);
}

fn status_icon(status: ExecutionStatus) -> String {
    let icon = match status {
        ExecutionStatus::Running => "⏳",
        ExecutionStatus::Success => "✅",
        ExecutionStatus::Failed => "❌",
        ExecutionStatus::Timeout => "⏰",
        ExecutionStatus::Cancelled => "⏹️",
    };
    format!("{icon} {status}")
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

fn first_line(s: &str) -> String {
    truncate(s.lines().next().unwrap_or(""), 60)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
