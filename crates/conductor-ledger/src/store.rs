use crate::entry::LedgerEntry;
use crate::summary::{summarize, summarize_history, HistorySummary, RunSummary};
use async_trait::async_trait;
use conductor_core::ConductorResult;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

// ---------------------------------------------------------------------------
// LedgerStore trait
// ---------------------------------------------------------------------------

/// Append-only storage for ledger entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one entry to its run's ledger.
    async fn append(&self, entry: LedgerEntry) -> ConductorResult<()>;
    /// Entries of `run_id` in append order. Unknown runs yield none.
    async fn entries(&self, run_id: &str) -> ConductorResult<Vec<LedgerEntry>>;
    /// Every run with at least one entry, sorted.
    async fn runs(&self) -> ConductorResult<Vec<String>>;

    /// Summarize one run.
    async fn summarize(&self, run_id: &str) -> ConductorResult<RunSummary> {
        let entries = self.entries(run_id).await?;
        Ok(summarize(run_id, &entries))
    }

    /// Summarize every run.
    async fn history(&self) -> ConductorResult<HistorySummary> {
        let mut runs = Vec::new();
        for run_id in self.runs().await? {
            let entries = self.entries(&run_id).await?;
            runs.push((run_id, entries));
        }
        Ok(summarize_history(&runs))
    }
}

// ---------------------------------------------------------------------------
// FileLedger
// ---------------------------------------------------------------------------

/// One JSONL file per run: `<dir>/<run_id>.jsonl`.
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    /// Open the ledger in `dir`, creating it if needed.
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn ledger_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }
}

#[async_trait]
impl LedgerStore for FileLedger {
    async fn append(&self, entry: LedgerEntry) -> ConductorResult<()> {
        let path = self.ledger_path(&entry.run_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn entries(&self, run_id: &str) -> ConductorResult<Vec<LedgerEntry>> {
        let path = self.ledger_path(run_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A crash mid-append can leave one torn line.
                Err(e) => {
                    warn!(run_id, line = n + 1, error = %e, "Skipping unreadable ledger line");
                }
            }
        }
        Ok(entries)
    }

    async fn runs(&self) -> ConductorResult<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".jsonl") {
                    runs.push(stem.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
