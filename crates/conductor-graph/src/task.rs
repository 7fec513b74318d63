use chrono::{DateTime, Utc};
use conductor_core::{AttemptId, Complexity, Priority, TaskCategory, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Why a task is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// A dependency failed (or is itself blocked).
    Dependency {
        /// The dependency that stopped this task.
        task: TaskId,
    },
    /// Verification found the environment not ready.
    Environment {
        /// What was unavailable.
        detail: String,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Dependency { task } => write!(f, "dependency {task}"),
            BlockReason::Environment { detail } => write!(f, "environment: {detail}"),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker never signaled within its budget.
    DispatchTimeout,
    /// Verification adjudicated FAIL.
    VerificationFailed,
    /// An evidence fingerprint did not match.
    EvidenceTampered,
    /// The coordinator restarted and the worker left no completion record.
    WorkerOrphaned,
    /// The executor could not start the worker.
    LaunchFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::DispatchTimeout => write!(f, "dispatch_timeout"),
            FailureKind::VerificationFailed => write!(f, "verification_failed"),
            FailureKind::EvidenceTampered => write!(f, "evidence_tampered"),
            FailureKind::WorkerOrphaned => write!(f, "worker_orphaned"),
            FailureKind::LaunchFailed => write!(f, "launch_failed"),
        }
    }
}

/// Failure details attached to a `failed` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable cause.
    pub detail: String,
}

impl TaskFailure {
    /// Failure of `kind` with `detail`.
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// One entry of a task's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status before the change.
    pub from: TaskStatus,
    /// Status after the change.
    pub to: TaskStatus,
    /// When the change was applied.
    pub at: DateTime<Utc>,
    /// Why the change was made.
    pub reason: String,
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, stable across restarts.
    pub id: TaskId,
    /// Short title for reports.
    #[serde(default)]
    pub title: String,
    /// Worker category that runs the task.
    pub category: TaskCategory,
    /// Selects the execution budget.
    #[serde(default)]
    pub complexity: Complexity,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// What the task must achieve.
    pub objective: String,
    /// Conditions the result is verified against.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Ordered implementation steps.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Tasks that must pass before this one is eligible.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Failed task this one retries. Set on remediation tasks only.
    #[serde(default)]
    pub supersedes: Option<TaskId>,
    /// Task whose worker proposed this one.
    #[serde(default)]
    pub parent: Option<TaskId>,
    /// Depth in the proposal hierarchy (0 = created by decomposition).
    #[serde(default)]
    pub depth: u32,
    /// Most recent dispatch attempt.
    #[serde(default)]
    pub attempt: Option<AttemptId>,
    /// Set while the task is `blocked`.
    #[serde(default)]
    pub block_reason: Option<BlockReason>,
    /// Set while the task is `failed`.
    #[serde(default)]
    pub failure: Option<TaskFailure>,
    /// How many times an environment block has been lifted for a fresh attempt.
    #[serde(default)]
    pub environment_rescans: u32,
    /// Insertion order assigned by the graph.
    #[serde(default)]
    pub seq: u64,
    /// Every status change, oldest first.
    #[serde(default)]
    pub history: Vec<StatusChange>,
    /// When the task entered the graph.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Pending task with no dependencies.
    pub fn new(
        id: impl Into<TaskId>,
        category: TaskCategory,
        objective: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            category,
            complexity: Complexity::default(),
            priority: Priority::default(),
            objective: objective.into(),
            acceptance_criteria: Vec::new(),
            steps: Vec::new(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            supersedes: None,
            parent: None,
            depth: 0,
            attempt: None,
            block_reason: None,
            failure: None,
            environment_rescans: 0,
            seq: 0,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the complexity tier.
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the dependency set.
    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the acceptance criteria.
    pub fn with_acceptance_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the steps.
    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = steps.into_iter().map(Into::into).collect();
        self
    }

    /// Title if set, otherwise the objective.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.objective
        } else {
            &self.title
        }
    }

    /// Pending and every dependency is in `satisfied`.
    pub fn is_ready(&self, satisfied: &HashSet<&TaskId>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| satisfied.contains(dep))
    }

    /// Build the remediation task that retries this failed one in a later loop.
    ///
    /// The new task carries the same payload and dependencies under the id
    /// `<root>-R<n>`, and `supersedes` points back at this task.
    pub fn remediation(&self, root: &TaskId, attempt_number: u32) -> Task {
        let mut retry = Task::new(
            format!("{root}-R{attempt_number}"),
            self.category,
            self.objective.clone(),
        )
        .with_title(self.title.clone())
        .with_complexity(self.complexity)
        .with_priority(self.priority)
        .with_acceptance_criteria(self.acceptance_criteria.clone())
        .with_steps(self.steps.clone());
        retry.dependencies = self.dependencies.clone();
        retry.parent = self.parent.clone();
        retry.depth = self.depth;
        retry.supersedes = Some(self.id.clone());
        retry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("BUILD-001", TaskCategory::Build, "Implement auth module");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.complexity, Complexity::Normal);
        assert!(task.dependencies.is_empty());
        assert!(task.history.is_empty());
        assert_eq!(task.display_title(), "Implement auth module");
    }

    #[test]
    fn test_task_is_ready_with_deps() {
        let dep: TaskId = "BUILD-001".into();
        let task = Task::new("TEST-001", TaskCategory::Test, "Test auth")
            .with_dependencies([dep.clone()]);
        assert!(!task.is_ready(&HashSet::new()));
        assert!(task.is_ready(&HashSet::from([&dep])));
    }

    #[test]
    fn test_task_not_ready_when_in_progress() {
        let mut task = Task::new("BUILD-002", TaskCategory::Build, "Running");
        task.status = TaskStatus::InProgress;
        assert!(!task.is_ready(&HashSet::new()));
    }

    #[test]
    fn test_remediation_copies_payload() {
        let task = Task::new("BUILD-003", TaskCategory::Build, "Implement cache")
            .with_complexity(Complexity::Complex)
            .with_dependencies(["BUILD-001"])
            .with_acceptance_criteria(["hits are served from memory"]);
        let retry = task.remediation(&task.id, 1);
        assert_eq!(retry.id.as_str(), "BUILD-003-R1");
        assert_eq!(retry.supersedes, Some(task.id.clone()));
        assert_eq!(retry.dependencies, task.dependencies);
        assert_eq!(retry.complexity, Complexity::Complex);
        assert_eq!(retry.acceptance_criteria.len(), 1);
        assert_eq!(retry.status, TaskStatus::Pending);
    }

    #[test]
    fn test_block_reason_serialization() {
        let reason = BlockReason::Dependency {
            task: "BUILD-001".into(),
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"kind\":\"dependency\""));
        let parsed: BlockReason = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reason);
    }
}
