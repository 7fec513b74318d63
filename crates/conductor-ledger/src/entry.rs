use chrono::{DateTime, Utc};
use conductor_core::{Complexity, Cost, TaskCategory, TaskId, VerdictKind};
use serde::{Deserialize, Serialize};

/// One adjudicated task attempt. Appended once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Run the attempt belongs to.
    pub run_id: String,
    /// Loop in which it was adjudicated.
    pub loop_number: u32,
    /// Task that was attempted.
    pub task_id: TaskId,
    /// Worker category of the task.
    pub category: TaskCategory,
    /// Complexity tier of the task.
    pub complexity: Complexity,
    /// Adjudicated outcome.
    pub verdict: VerdictKind,
    /// Short explanation of the verdict (e.g. `dispatch_timeout`).
    #[serde(default)]
    pub reason: String,
    /// Cost reported by the worker.
    #[serde(default)]
    pub cost: Cost,
    /// When the entry was appended.
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry with no reason and zero cost.
    pub fn new(
        run_id: impl Into<String>,
        loop_number: u32,
        task_id: TaskId,
        category: TaskCategory,
        complexity: Complexity,
        verdict: VerdictKind,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            loop_number,
            task_id,
            category,
            complexity,
            verdict,
            reason: String::new(),
            cost: Cost::default(),
            recorded_at: Utc::now(),
        }
    }

    /// Set the verdict reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Set the reported cost.
    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }
}
