//! Notice routing: operational events (retry exhaustion, orphaned runs, tick
//! failures) go to an external append-only memory store.
//! Delivery is best effort. A failing sink is logged and never fails a tick.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskd_core::{NotifyConfig, Result, TaskdError};

const HISTORY_LIMIT: usize = 100;

/// One record for the memory store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub text: String,
    /// Free-form type, e.g. `task_failure`.
    pub kind: String,
    pub tags: Vec<String>,
    /// 1–10.
    pub importance: u8,
    pub created_at: DateTime<Utc>,
}

impl Notice {
    pub fn new(text: impl Into<String>, kind: &str, tags: &[&str], importance: u8) -> Self {
        Self {
            text: text.into(),
            kind: kind.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            importance: importance.clamp(1, 10),
            created_at: Utc::now(),
        }
    }
}

/// Somewhere a notice can be written.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    fn name(&self) -> &str;
    async fn record(&self, notice: &Notice) -> Result<()>;
}

/// Logs notices through `tracing`. Always installed.
pub struct TracingSink;

#[async_trait]
impl NoticeSink for TracingSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn record(&self, notice: &Notice) -> Result<()> {
        if notice.importance >= 7 {
            tracing::warn!("🚨 [{}] {} (importance {})", notice.kind, notice.text, notice.importance);
        } else {
            tracing::info!("📢 [{}] {} (importance {})", notice.kind, notice.text, notice.importance);
        }
        Ok(())
    }
}

/// Runs a memory-store command with the notice appended as
/// `<text> --type <kind> --tags <a,b> --importance <n>`.
pub struct CommandSink {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        let argv = argv
            .into_iter()
            .map(|a| shellexpand::tilde(&a).to_string())
            .collect();
        Self { argv, timeout }
    }

    fn args_for(&self, notice: &Notice) -> Vec<String> {
        let mut args: Vec<String> = self.argv.iter().skip(1).cloned().collect();
        args.push(notice.text.clone());
        args.push("--type".into());
        args.push(notice.kind.clone());
        args.push("--tags".into());
        args.push(notice.tags.join(","));
        args.push("--importance".into());
        args.push(notice.importance.to_string());
        args
    }
}

#[async_trait]
impl NoticeSink for CommandSink {
    fn name(&self) -> &str {
        "command"
    }

    async fn record(&self, notice: &Notice) -> Result<()> {
        let program = self
            .argv
            .first()
            .ok_or_else(|| TaskdError::Config("notify.command is empty".into()))?;

        let run = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(program)
                .args(self.args_for(notice))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TaskdError::Executor(format!("notice command timed out after {:?}", self.timeout)))?
        .map_err(|e| TaskdError::Executor(format!("notice command failed to start: {e}")))?;

        if run.status.success() {
            Ok(())
        } else {
            Err(TaskdError::Executor(format!(
                "notice command exited with {}: {}",
                run.status,
                String::from_utf8_lossy(&run.stderr).trim()
            )))
        }
    }
}

/// POSTs notices as JSON.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl NoticeSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn record(&self, notice: &Notice) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "text": notice.text,
                "type": notice.kind,
                "tags": notice.tags,
                "importance": notice.importance,
                "timestamp": notice.created_at.to_rfc3339(),
            }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TaskdError::Executor(format!("webhook send failed: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TaskdError::Executor(format!("webhook error {}", resp.status())))
        }
    }
}

/// Fans notices out to every sink and keeps the last 100 in memory.
pub struct NoticeRouter {
    sinks: Vec<Arc<dyn NoticeSink>>,
    history: Mutex<VecDeque<Notice>>,
    enabled: bool,
}

impl NoticeRouter {
    /// Router with only the tracing sink.
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(TracingSink)],
            history: Mutex::new(VecDeque::new()),
            enabled: true,
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut router = Self::new();
        router.enabled = config.enabled;
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        if let Some(argv) = config.command.as_ref().filter(|a| !a.is_empty()) {
            router.add_sink(Arc::new(CommandSink::new(argv.clone(), timeout)));
        }
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            router.add_sink(Arc::new(WebhookSink::new(url, timeout)));
        }
        router
    }

    pub fn add_sink(&mut self, sink: Arc<dyn NoticeSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Deliver to all sinks. Never fails.
    pub async fn publish(&self, notice: Notice) {
        if !self.enabled {
            return;
        }
        for sink in &self.sinks {
            if let Err(e) = sink.record(&notice).await {
                tracing::warn!("⚠️ Notice sink '{}' failed: {e}", sink.name());
            }
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(notice);
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// Recently published notices, oldest first.
    pub fn history(&self) -> Vec<Notice> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for NoticeRouter {
    fn default() -> Self {
        Self::new()
    }
}
