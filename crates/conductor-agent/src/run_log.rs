use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::types::{ExecutionEvent, ExecutionId};

/// JSONL execution logger.
///
/// Writes the events of one execution as JSONL (one JSON object per line)
/// to `{log_dir}/{execution_id}/{timestamp}.jsonl`. Lines are flushed as
/// they are written, so a crashed run keeps everything logged so far.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=node transitions,
    /// 3=retries and reflection.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events for `execution_id` until its `RunComplete`, the run's
    /// `finished` signal, or cancellation.
    ///
    /// Takes a receiver subscribed before the run started so `RunStarted`
    /// is never missed. Events dropped because the receiver lagged are
    /// recorded as a `log_truncated` line.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<ExecutionEvent>,
        execution_id: ExecutionId,
        finished: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(execution_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        debug!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);
        let done = wait_finished(finished);
        tokio::pin!(done);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                _ = &mut done => {
                    // RunComplete is published before the finished signal.
                    self.drain(&mut rx, &execution_id, &mut writer).await;
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            match self.write_event(&mut writer, &event, &execution_id).await {
                                Ok(true) => break,
                                Ok(false) => {}
                                Err(e) => {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(execution_id = %execution_id, skipped = n, "RunLogger lagged, skipped events");
                            if let Err(e) = self.write_truncated(&mut writer, &execution_id, n).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        let _ = writer.flush().await;
        info!(path = %log_path.display(), execution_id = %execution_id, "Run log closed");
    }

    /// Write whatever is still buffered for this execution.
    async fn drain(
        &self,
        rx: &mut broadcast::Receiver<ExecutionEvent>,
        execution_id: &ExecutionId,
        writer: &mut LogWriter,
    ) {
        loop {
            let written = match rx.try_recv() {
                Ok(event) => match self.write_event(writer, &event, execution_id).await {
                    Ok(true) => return,
                    other => other.map(|_| ()),
                },
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.write_truncated(writer, execution_id, n).await
                }
                Err(_) => return,
            };
            if let Err(e) = written {
                error!(error = %e, "Failed to write log entry");
                return;
            }
        }
    }

    /// Write one event if it belongs to this execution. Returns `true` for
    /// the execution's `RunComplete`.
    async fn write_event(
        &self,
        writer: &mut LogWriter,
        event: &ExecutionEvent,
        execution_id: &ExecutionId,
    ) -> std::io::Result<bool> {
        if event.execution_id() != Some(execution_id) {
            return Ok(false);
        }
        if let Some(entry) = self.event_to_entry(event) {
            write_entry(writer, &entry).await?;
        }
        Ok(matches!(event, ExecutionEvent::RunComplete { .. }))
    }

    async fn write_truncated(
        &self,
        writer: &mut LogWriter,
        execution_id: &ExecutionId,
        skipped: u64,
    ) -> std::io::Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: execution_id.to_string(),
            event_type: "log_truncated".into(),
            node_id: None,
            detail: Some(serde_json::json!({ "skipped": skipped })),
        };
        write_entry(writer, &entry).await
    }

    fn event_to_entry(&self, event: &ExecutionEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&str>, detail: Option<serde_json::Value>| {
            LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                execution_id: event
                    .execution_id()
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                event_type: event_type.to_string(),
                node_id: node_id.map(str::to_string),
                detail,
            }
        };

        match event {
            ExecutionEvent::RunStarted { graph_id, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "graph_id": graph_id })),
            )),
            ExecutionEvent::RunComplete {
                status, elapsed_ms, ..
            } => Some(entry(
                "run_complete",
                None,
                Some(serde_json::json!({ "status": status, "elapsed_ms": elapsed_ms })),
            )),

            ExecutionEvent::NodeStatusChanged {
                node_id,
                status,
                attempt,
                ..
            } if self.level >= 2 => Some(entry(
                "node_status_changed",
                Some(node_id),
                Some(serde_json::json!({ "status": status, "attempt": attempt })),
            )),

            ExecutionEvent::NodeRetrying {
                node_id,
                attempt,
                backoff_ms,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "node_retrying",
                Some(node_id),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "backoff_ms": backoff_ms,
                    "error": truncate_str(error, 200),
                })),
            )),
            ExecutionEvent::ReflectionFinished {
                node_id, quality, ..
            } if self.level >= 3 => Some(entry(
                "reflection_finished",
                Some(node_id),
                serde_json::to_value(quality).ok(),
            )),

            _ => None,
        }
    }
}

type LogWriter = tokio::io::BufWriter<tokio::fs::File>;

async fn write_entry(writer: &mut LogWriter, entry: &LogEntry) -> std::io::Result<()> {
    let Ok(json) = serde_json::to_string(entry) else {
        return Ok(());
    };
    writer.write_all(format!("{}\n", json).as_bytes()).await?;
    writer.flush().await
}

/// Resolves once the run reports finished or its sender is gone.
async fn wait_finished(mut finished: watch::Receiver<bool>) {
    let _ = finished.wait_for(|done| *done).await;
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
