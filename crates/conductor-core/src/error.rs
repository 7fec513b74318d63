use crate::types::{AttemptId, TaskId, TaskStatus};
use std::time::Duration;

/// Top-level error type for the Conductor orchestrator.
///
/// Integrity errors (see [`ConductorError::is_integrity`]) abort the
/// coordinator. Everything else is scoped to a single task and is recorded on
/// that task instead of stopping the run.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Adding tasks would introduce a dependency cycle. The whole batch is rejected.
    #[error("Dependency cycle detected: {}", join_ids(.0))]
    Cycle(Vec<TaskId>),

    /// A task identifier that the graph does not contain.
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// A status change outside the legal transition table.
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        /// Task being changed.
        id: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// A compare-and-set lost the race: the task was not in the expected state.
    #[error("Status conflict for task {id}: expected {expected}, found {actual}")]
    StatusConflict {
        /// Task being changed.
        id: TaskId,
        /// Status the caller expected.
        expected: String,
        /// Status actually found.
        actual: String,
    },

    /// A task identifier that already exists in the graph.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// An edge naming a task the graph does not contain.
    #[error("Task {task} depends on unknown task {dependency}")]
    DanglingDependency {
        /// Dependent task.
        task: TaskId,
        /// Missing dependency.
        dependency: TaskId,
    },

    /// No completion signal arrived within the attempt's budget.
    #[error("Task {task} timed out after {timeout:?} without signaling completion")]
    DispatchTimeout {
        /// Task whose worker went silent.
        task: TaskId,
        /// Budget that elapsed.
        timeout: Duration,
    },

    /// An evidence artifact does not match its reported fingerprint.
    #[error("Evidence tampered for task {task}: {artifact}")]
    EvidenceTamper {
        /// Task that supplied the artifact.
        task: TaskId,
        /// Artifact path relative to the output directory.
        artifact: String,
    },

    /// An external dependency needed for verification is unavailable.
    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// A second completion signal for the same attempt.
    #[error("Completion already signaled for task {task} attempt {attempt}")]
    AlreadySignaled {
        /// Task that signaled.
        task: TaskId,
        /// Attempt that signaled.
        attempt: AttemptId,
    },

    /// Malformed specification input.
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The agent executor could not launch a worker.
    #[error("Executor error: {0}")]
    Executor(String),

    /// Corrupted or unreadable persisted state.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Errors that indicate a coordinator bug or corrupted state. These abort
    /// the run; all other errors are local to one task.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ConductorError::UnknownTask(_)
                | ConductorError::InvalidTransition { .. }
                | ConductorError::DanglingDependency { .. }
                | ConductorError::Store(_)
        )
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ConductorError::Cycle(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(err.to_string(), "Dependency cycle detected: A -> B -> A");
    }

    #[test]
    fn test_integrity_classification() {
        assert!(ConductorError::UnknownTask("X".into()).is_integrity());
        assert!(ConductorError::InvalidTransition {
            id: "X".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::Pending,
        }
        .is_integrity());
        assert!(!ConductorError::DispatchTimeout {
            task: "X".into(),
            timeout: Duration::from_secs(1),
        }
        .is_integrity());
        assert!(!ConductorError::EnvironmentUnavailable("db".into()).is_integrity());
    }
}
