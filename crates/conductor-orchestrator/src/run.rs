use crate::spawner::SpawnRequest;
use chrono::{DateTime, Utc};
use conductor_core::persist::{read_json, write_json};
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Loops may still be run.
    Running,
    /// A loop found nothing to dispatch.
    Completed,
    /// Stopped by an abort request.
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// What one loop did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRecord {
    /// Loop number, from 1.
    pub number: u32,
    /// Dispatch cap in force for this loop.
    pub cap: usize,
    /// Workers launched.
    pub dispatched: usize,
    /// Attempts that passed.
    pub completed: usize,
    /// Attempts that failed.
    pub failed: usize,
    /// Attempts that were blocked.
    pub blocked: usize,
    /// When the loop started.
    pub started_at: DateTime<Utc>,
    /// Set once every attempt of the loop is settled.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl LoopRecord {
    /// Empty record for loop `number`.
    pub fn new(number: u32, cap: usize) -> Self {
        Self {
            number,
            cap,
            dispatched: 0,
            completed: 0,
            failed: 0,
            blocked: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Durable state of one run, persisted as `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// `run-<timestamp>` id, also the ledger file name.
    pub run_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Name of the decomposed document.
    #[serde(default)]
    pub spec_name: String,
    /// Every loop so far, oldest first.
    #[serde(default)]
    pub loops: Vec<LoopRecord>,
    /// Proposals accepted during a loop, added to the graph at the next boundary.
    #[serde(default)]
    pub staged: Vec<SpawnRequest>,
    /// When the run was started.
    pub started_at: DateTime<Utc>,
    /// Set when the run completes or aborts.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Fresh running run.
    pub fn new(spec_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("run-{}", now.format("%Y%m%d-%H%M%S")),
            status: RunStatus::Running,
            spec_name: spec_name.into(),
            loops: Vec::new(),
            staged: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    /// Number the next loop will carry.
    pub fn next_loop(&self) -> u32 {
        self.loops.last().map(|l| l.number + 1).unwrap_or(1)
    }

    /// Close the run with `status`.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// `run.json` and the `ABORT` marker in the state directory.
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    /// Run state file name.
    pub const FILE: &'static str = "run.json";
    /// Abort marker file name.
    pub const ABORT_FILE: &'static str = "ABORT";

    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// State directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The saved run, if any.
    pub async fn load(&self) -> ConductorResult<Option<RunState>> {
        read_json(&self.dir.join(Self::FILE)).await
    }

    /// Persist `state` atomically.
    pub async fn save(&self, state: &RunState) -> ConductorResult<()> {
        write_json(&self.dir.join(Self::FILE), state).await
    }

    /// Whether an abort marker is present.
    pub async fn abort_requested(&self) -> bool {
        tokio::fs::try_exists(self.dir.join(Self::ABORT_FILE))
            .await
            .unwrap_or(false)
    }

    /// Ask a running coordinator (possibly in another process) to stop.
    pub async fn request_abort(&self) -> ConductorResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(Self::ABORT_FILE), Utc::now().to_rfc3339()).await?;
        Ok(())
    }

    /// Remove the abort marker if present.
    pub async fn clear_abort(&self) -> ConductorResult<()> {
        match tokio::fs::remove_file(self.dir.join(Self::ABORT_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
