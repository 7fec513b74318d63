use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single dispatch attempt. A fresh one is minted every time a
/// task moves to `in_progress`.
pub type AttemptId = uuid::Uuid;

/// Stable, human-readable task identifier (e.g. `BUILD-001`, `TEST-001-2`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its dependencies or for a free slot.
    Pending,
    /// A worker has been dispatched for the current attempt.
    InProgress,
    /// Independently verified as done.
    Completed,
    /// Verification failed, the worker timed out, or the launch failed.
    Failed,
    /// Cannot proceed until a dependency or the environment is fixed.
    Blocked,
}

impl TaskStatus {
    /// Whether `self -> next` is one of the legal transitions.
    ///
    /// `in_progress -> blocked` is taken when verification adjudicates an
    /// environmental defect.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Blocked, Completed, Failed, InProgress, Pending};
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Pending, Blocked)
                | (Blocked, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Kind of work a task represents. Selects the worker profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Implements a feature.
    Build,
    /// Writes and runs tests for a feature.
    Test,
    /// Adversarially re-checks another task's output.
    Verify,
    /// Splits a goal into further tasks.
    Decompose,
    /// Investigates and proposes new tasks between loops.
    Research,
    /// Analyses results of previous runs.
    Analyze,
}

impl TaskCategory {
    /// Every category, in declaration order.
    pub const ALL: [TaskCategory; 6] = [
        TaskCategory::Build,
        TaskCategory::Test,
        TaskCategory::Verify,
        TaskCategory::Decompose,
        TaskCategory::Research,
        TaskCategory::Analyze,
    ];

    /// Categories whose workers may propose new tasks.
    pub fn proposes_tasks(self) -> bool {
        matches!(self, TaskCategory::Decompose | TaskCategory::Research)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskCategory::Build => write!(f, "build"),
            TaskCategory::Test => write!(f, "test"),
            TaskCategory::Verify => write!(f, "verify"),
            TaskCategory::Decompose => write!(f, "decompose"),
            TaskCategory::Research => write!(f, "research"),
            TaskCategory::Analyze => write!(f, "analyze"),
        }
    }
}

/// Complexity tier. Selects the execution budget, not correctness.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Small, mechanical change.
    Easy,
    /// Typical feature work.
    #[default]
    Normal,
    /// Cross-cutting or risky work.
    Complex,
}

impl Complexity {
    /// Every tier, easiest first.
    pub const ALL: [Complexity; 3] = [Complexity::Easy, Complexity::Normal, Complexity::Complex];
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Easy => write!(f, "easy"),
            Complexity::Normal => write!(f, "normal"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// Scheduling priority. Ordering puts `Critical` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must run before anything else that is eligible.
    Critical,
    /// Preferred over medium work.
    High,
    /// Default priority.
    #[default]
    Medium,
    /// Runs when nothing else is eligible.
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Independently adjudicated outcome of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictKind {
    /// Evidence reproduced and the skip rate is within policy.
    Pass,
    /// Evidence contradicts the claim, was tampered with, or is missing due to a defect.
    Fail,
    /// Evidence is missing because the environment was not ready.
    Blocked,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictKind::Pass => write!(f, "PASS"),
            VerdictKind::Fail => write!(f, "FAIL"),
            VerdictKind::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// Resource usage of one task attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    /// Model tokens consumed by the worker.
    #[serde(default)]
    pub tokens: u64,
    /// Wall-clock time spent by the worker.
    #[serde(default)]
    pub duration_ms: u64,
}

impl Cost {
    /// Build a cost record.
    pub fn new(tokens: u64, duration_ms: u64) -> Self {
        Self {
            tokens,
            duration_ms,
        }
    }

    /// Component-wise saturating sum.
    pub fn add(self, other: Cost) -> Cost {
        Cost {
            tokens: self.tokens.saturating_add(other.tokens),
            duration_ms: self.duration_ms.saturating_add(other.duration_ms),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Blocked));
        assert!(Pending.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Pending));
    }

    #[test]
    fn test_illegal_transitions() {
        use TaskStatus::*;
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Blocked.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(parsed, TaskStatus::Blocked);
    }

    #[test]
    fn test_priority_ordering() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(VerdictKind::Pass.to_string(), "PASS");
        assert_eq!(VerdictKind::Blocked.to_string(), "BLOCKED");
        let json = serde_json::to_string(&VerdictKind::Fail).unwrap();
        assert_eq!(json, "\"FAIL\"");
    }

    #[test]
    fn test_task_id_transparent_serde() {
        let id = TaskId::from("BUILD-001");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"BUILD-001\"");
        assert_eq!(id.to_string(), "BUILD-001");
    }

    #[test]
    fn test_cost_add_saturates() {
        let total = Cost::new(u64::MAX, 10).add(Cost::new(5, 20));
        assert_eq!(total.tokens, u64::MAX);
        assert_eq!(total.duration_ms, 30);
    }

    #[test]
    fn test_proposing_categories() {
        assert!(TaskCategory::Research.proposes_tasks());
        assert!(TaskCategory::Decompose.proposes_tasks());
        assert!(!TaskCategory::Build.proposes_tasks());
    }
}
