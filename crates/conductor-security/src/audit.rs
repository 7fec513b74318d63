use chrono::{DateTime, Utc};
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Run the action belongs to.
    pub run_id: String,
    /// Task involved, if any.
    pub task_id: Option<String>,
    /// Action name, e.g. `dispatch` or `verify`.
    pub action: String,
    /// Structured details of the action.
    pub details: serde_json::Value,
    /// How it ended.
    pub outcome: AuditOutcome,
}

/// How an audited action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action succeeded.
    Success,
    /// The action was refused.
    Denied,
    /// The action failed.
    Error,
    /// Evidence did not match its reported fingerprint.
    Tamper,
}

enum AuditCommand {
    Append(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log persisted as `audit.jsonl`.
///
/// Entries are handed to a background writer so callers never block on disk.
/// [`AuditLog::flush`] waits until everything logged so far has been written.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditCommand>,
    path: PathBuf,
}

impl AuditLog {
    /// Log file name.
    pub const FILE: &'static str = "audit.jsonl";

    /// Create a new AuditLog. Spawns a background task that writes entries to disk.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditCommand>();
        let path = log_dir.join(Self::FILE);
        let log_file = path.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "Cannot create audit directory");
            }

            while let Some(command) = rx.recv().await {
                match command {
                    AuditCommand::Append(entry) => {
                        if let Err(e) = append_line(&log_file, &entry).await {
                            warn!(
                                error = %e,
                                action = %entry.action,
                                "Failed to write audit entry"
                            );
                        }
                    }
                    AuditCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, path }
    }

    /// Path of `audit.jsonl`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an entry for writing and trace it.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            run_id = %entry.run_id,
            task_id = entry.task_id.as_deref().unwrap_or("-"),
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        let _ = self.tx.send(AuditCommand::Append(entry));
    }

    /// Build and queue an entry stamped now.
    pub fn log_action(
        &self,
        run_id: impl Into<String>,
        task_id: Option<String>,
        action: impl Into<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            task_id,
            action: action.into(),
            details,
            outcome,
        });
    }

    /// Wait for the background writer to drain.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Read back every entry written so far.
    pub async fn entries(&self) -> ConductorResult<Vec<AuditEntry>> {
        self.flush().await;
        read_entries(&self.path).await
    }
}

async fn append_line(path: &Path, entry: &AuditEntry) -> ConductorResult<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Parse an `audit.jsonl` file. Unparseable lines are skipped.
pub async fn read_entries(path: &Path) -> ConductorResult<Vec<AuditEntry>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
