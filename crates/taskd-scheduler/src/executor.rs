//! Command executors. The coordinator owns timeouts and cancellation; an
//! executor only has to run a command to completion and report what happened.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use taskd_core::{ExecutorConfig, Result, TaskdError};

/// What a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs an opaque task command.
///
/// Implementations must stop the underlying work when the returned future is
/// dropped; that is how the coordinator enforces timeouts and shutdown.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// `Err` means the command could not be launched at all.
    async fn execute(&self, command: &str) -> Result<ExecutionResult>;
}

/// Runs commands through `<shell> -c`.
///
/// On Unix each command leads its own process group, and abandoning the
/// execution future kills the whole group, so nothing the command started in
/// the background survives a timeout or shutdown.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    max_output_bytes: usize,
}

impl ShellExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            workdir: config.resolved_workdir(),
            env: config.env.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(&ExecutorConfig::default())
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> Result<ExecutionResult> {
        let mut std_cmd = std::process::Command::new(&self.shell);
        std_cmd
            .arg("-c")
            .arg(command)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        if let Some(dir) = &self.workdir {
            std_cmd.current_dir(dir);
        }
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let started = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| TaskdError::Executor(format!("failed to launch '{}': {e}", self.shell)))?;
        let group = GroupGuard::new(child.id());
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TaskdError::Executor(format!("failed to collect output: {e}")))?;
        group.disarm();

        Ok(ExecutionResult {
            exit_code: output.status.code(),
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), self.max_output_bytes),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), self.max_output_bytes),
            duration: started.elapsed(),
        })
    }
}

/// Kills a command's process group unless disarmed after a normal exit.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: kill(2) takes plain integers; a stale group id only yields ESRCH.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc == 0 {
                tracing::debug!("Killed process group {pgid}");
            }
        }
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, noting the full size.
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n[truncated, {} bytes total]", &text[..end], text.len())
}
