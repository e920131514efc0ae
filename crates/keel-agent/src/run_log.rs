use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::config::LogConfig;
use keel_core::event::EventBus;
use keel_core::types::{KeelEvent, StageStatus};

/// JSONL observability sink.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{correlation_id}.jsonl`. Entries are buffered and written in
/// batches; a batch that cannot be written is dropped, never retried.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
    batch_size: usize,
    flush_interval: Duration,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    correlation_id: &'a str,
    event_type: &'static str,
    detail: &'a KeelEvent,
}

/// Counters reported when the logger stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLogStats {
    pub written: usize,
    pub dropped: usize,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = per stage, 3 = per tool call.
    pub fn new(log_dir: PathBuf, level: u8, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            log_dir,
            level,
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    pub fn from_config(log_dir: PathBuf, config: &LogConfig) -> Self {
        Self::new(
            log_dir,
            config.level,
            config.batch_size,
            Duration::from_millis(config.flush_interval_ms),
        )
    }

    /// Run until cancelled or the bus closes. Pending entries are flushed
    /// before returning.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) -> RunLogStats {
        let mut rx = event_bus.subscribe();
        let mut stats = RunLogStats::default();
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            warn!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
        }
        info!(path = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending: Vec<(String, String)> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush(&mut pending, &mut stats).await;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        if let Some(line) = self.render(&event) {
                            pending.push((event.correlation_id().to_string(), line));
                        }
                        if pending.len() >= self.batch_size {
                            self.flush(&mut pending, &mut stats).await;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        stats.dropped += n as usize;
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            }
        }

        self.flush(&mut pending, &mut stats).await;
        debug!(written = stats.written, dropped = stats.dropped, "RunLogger finished");
        stats
    }

    /// Serialize an event, or None if the level filters it out.
    fn render(&self, event: &KeelEvent) -> Option<String> {
        if event_level(event) > self.level {
            return None;
        }
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            correlation_id: event.correlation_id(),
            event_type: event.kind(),
            detail: event,
        };
        serde_json::to_string(&entry).ok()
    }

    async fn flush(&self, pending: &mut Vec<(String, String)>, stats: &mut RunLogStats) {
        if pending.is_empty() {
            return;
        }
        let mut by_run: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (cid, line) in pending.drain(..) {
            by_run.entry(cid).or_default().push(line);
        }
        for (cid, lines) in by_run {
            let path = self.log_dir.join(format!("{}.jsonl", sanitize(&cid)));
            match append_lines(&path, &lines).await {
                Ok(()) => stats.written += lines.len(),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), dropped = lines.len(), "Dropping log batch");
                    stats.dropped += lines.len();
                }
            }
        }
    }
}

/// Minimum verbosity at which an event is logged.
fn event_level(event: &KeelEvent) -> u8 {
    match event {
        KeelEvent::RunStarted { .. } | KeelEvent::RunComplete { .. } | KeelEvent::Error { .. } => 1,
        KeelEvent::AgentExecution {
            status: StageStatus::Started,
            ..
        } => 3,
        KeelEvent::AgentExecution { .. } | KeelEvent::CheckpointOperation { .. } => 2,
        KeelEvent::ToolCall { .. } | KeelEvent::StateChange { .. } => 3,
    }
}

fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

async fn append_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buf = lines.join("\n");
    buf.push('\n');
    file.write_all(buf.as_bytes()).await?;
    file.flush().await
}
