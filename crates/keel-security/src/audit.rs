use chrono::{DateTime, Utc};
use keel_core::{Reason, ReasonCode, Role, ToolCall, ToolKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// One line of `audit.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Caller role.
    pub role: Role,
    /// Tool called.
    pub tool: ToolKind,
    /// Operation called.
    pub operation: String,
    /// Decision or result.
    pub outcome: AuditOutcome,
    /// Code of a denial or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    /// Extra context, such as the denial message.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Passed the policy check; execution follows.
    Allowed,
    /// Refused by policy; never executed.
    Denied,
    /// Executed and succeeded.
    Succeeded,
    /// Executed and failed.
    Failed,
}

enum Message {
    Entry(Box<AuditEntry>),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log of every tool call decision and result.
///
/// Entries are written in submission order by a single background task.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<Message>,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new AuditLog writing to `<log_dir>/audit.jsonl`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let path = log_dir.join("audit.jsonl");
        let log_file = path.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "cannot create audit directory");
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(path = %log_file.display(), error = %e, "cannot open audit log");
                    None
                }
            };

            while let Some(message) = rx.recv().await {
                match message {
                    Message::Entry(entry) => {
                        let (Some(f), Ok(mut line)) = (file.as_mut(), serde_json::to_string(&entry))
                        else {
                            continue;
                        };
                        line.push('\n');
                        if let Err(e) = f.write_all(line.as_bytes()).await {
                            warn!(error = %e, "audit write failed");
                        }
                    }
                    Message::Flush(done) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush().await;
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, path }
    }

    /// Location of the JSONL file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Queue an entry and mirror it to the tracing log.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            role = %entry.role,
            tool = %entry.tool,
            operation = %entry.operation,
            outcome = ?entry.outcome,
            reason = entry.reason.map(|r| r.as_str()),
            "audit"
        );
        let _ = self.tx.send(Message::Entry(Box::new(entry)));
    }

    /// Record a policy verdict or execution result for `call`.
    pub fn record(
        &self,
        call: &ToolCall,
        outcome: AuditOutcome,
        reason: Option<&Reason>,
        details: serde_json::Value,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            role: call.role,
            tool: call.tool,
            operation: call.operation.clone(),
            outcome,
            reason: reason.map(|r| r.code),
            details,
        });
    }

    /// Wait until every entry logged so far has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
