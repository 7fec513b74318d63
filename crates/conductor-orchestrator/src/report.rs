//! What a worker reports when it signals completion, and what the
//! verification pipeline decides about it.

use chrono::{DateTime, Utc};
use conductor_core::{AttemptId, Complexity, Cost, Priority, TaskCategory, TaskId, VerdictKind};
use serde::{Deserialize, Serialize};

/// The worker's own claim about the attempt. Untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimedOutcome {
    /// The worker says the task is done.
    #[serde(alias = "success")]
    ClaimedSuccess,
    /// The worker says it could not finish.
    #[serde(alias = "failure")]
    ClaimedFailure,
}

/// A file the worker produced, with the digest it computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceArtifact {
    /// Relative to the attempt's output directory.
    pub path: String,
    /// Hex SHA-256 of the file as the worker saw it.
    pub sha256: String,
}

/// Why a sub-check was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A service, credential or tool was unavailable.
    Environment,
    /// The check does not apply to this task.
    NotApplicable,
    /// Any other reason.
    Other,
}

/// Cause of a sub-check error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The environment broke the check.
    Environment,
    /// The code under test broke the check.
    Implementation,
}

/// Result of one sub-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    /// The check succeeded.
    Passed,
    /// The check ran and found a defect.
    Failed {
        /// What went wrong.
        #[serde(default)]
        detail: String,
    },
    /// The check did not run.
    Skipped {
        /// Why it did not run.
        reason: SkipReason,
    },
    /// The check could not complete.
    Error {
        /// Whose fault the error was.
        kind: ErrorKind,
        /// What went wrong.
        #[serde(default)]
        detail: String,
    },
}

impl CheckStatus {
    /// Whether the check was skipped.
    pub fn is_skip(&self) -> bool {
        matches!(self, CheckStatus::Skipped { .. })
    }

    /// Whether the check points at the environment rather than the code.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            CheckStatus::Skipped {
                reason: SkipReason::Environment
            } | CheckStatus::Error {
                kind: ErrorKind::Environment,
                ..
            }
        )
    }
}

/// One sub-check, as reported by the worker or by an independent check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Check name.
    pub name: String,
    /// Check result.
    #[serde(flatten)]
    pub status: CheckStatus,
}

impl CheckReport {
    /// Report for check `name`.
    pub fn new(name: impl Into<String>, status: CheckStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// A new task suggested by a research or decompose worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProposal {
    /// Proposed id. Must be new to the graph.
    pub id: String,
    /// Short title. Defaults to the id.
    #[serde(default)]
    pub title: String,
    /// Worker category that should run it.
    pub category: TaskCategory,
    /// What the task must achieve.
    pub objective: String,
    /// Conditions the result is verified against.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Existing or co-proposed task ids.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Selects the execution budget.
    #[serde(default)]
    pub complexity: Complexity,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
}

/// What a worker writes in its completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Claimed outcome.
    pub outcome: ClaimedOutcome,
    /// Free-form summary.
    #[serde(default)]
    pub summary: String,
    /// Files offered as evidence.
    #[serde(default)]
    pub artifacts: Vec<EvidenceArtifact>,
    /// Sub-checks the worker ran itself.
    #[serde(default)]
    pub checks: Vec<CheckReport>,
    /// Resources the attempt used.
    #[serde(default)]
    pub cost: Cost,
    /// Tasks to add to the graph.
    #[serde(default)]
    pub proposed_tasks: Vec<TaskProposal>,
}

impl WorkerReport {
    /// Claimed success with no evidence.
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            outcome: ClaimedOutcome::ClaimedSuccess,
            summary: summary.into(),
            artifacts: Vec::new(),
            checks: Vec::new(),
            cost: Cost::default(),
            proposed_tasks: Vec::new(),
        }
    }

    /// Claimed failure with no evidence.
    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            outcome: ClaimedOutcome::ClaimedFailure,
            ..Self::success(summary)
        }
    }

    /// Add an artifact with its digest.
    pub fn with_artifact(mut self, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.artifacts.push(EvidenceArtifact {
            path: path.into(),
            sha256: sha256.into(),
        });
        self
    }

    /// Add a self-reported sub-check.
    pub fn with_check(mut self, name: impl Into<String>, status: CheckStatus) -> Self {
        self.checks.push(CheckReport::new(name, status));
        self
    }

    /// Set the reported cost.
    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }

    /// Add a proposed task.
    pub fn with_proposal(mut self, proposal: TaskProposal) -> Self {
        self.proposed_tasks.push(proposal);
        self
    }
}

/// Adjudicated outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// PASS, FAIL or BLOCKED.
    pub kind: VerdictKind,
    /// Why, in one line.
    pub reason: String,
    /// What was examined, one line per item.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Skipped checks over all checks.
    #[serde(default)]
    pub skip_rate: f64,
    /// An evidence fingerprint did not match. Always paired with FAIL.
    #[serde(default)]
    pub tampered: bool,
}

impl Verdict {
    /// Verdict with no evidence lines.
    pub fn new(kind: VerdictKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            evidence: Vec::new(),
            skip_rate: 0.0,
            tampered: false,
        }
    }
}

/// Persisted at `complete/<task>.<attempt>.done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Task that was attempted.
    pub task_id: TaskId,
    /// Attempt being reported.
    pub attempt: AttemptId,
    /// When the worker signaled.
    pub signaled_at: DateTime<Utc>,
    /// The worker's report.
    pub report: WorkerReport,
    /// Filled in once verification has run.
    #[serde(default)]
    pub verdict: Option<Verdict>,
}

impl CompletionRecord {
    /// Record of `report` stamped now.
    pub fn new(task_id: TaskId, attempt: AttemptId, report: WorkerReport) -> Self {
        Self {
            task_id,
            attempt,
            signaled_at: Utc::now(),
            report,
            verdict: None,
        }
    }
}
