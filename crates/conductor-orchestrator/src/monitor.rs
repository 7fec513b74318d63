use conductor_core::{Cost, TaskCategory, TaskId, VerdictKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters for one worker category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Workers launched.
    pub dispatched: u64,
    /// PASS verdicts.
    pub passed: u64,
    /// FAIL verdicts, timeouts included.
    pub failed: u64,
    /// BLOCKED verdicts.
    pub blocked: u64,
    /// Attempts that never signaled.
    pub timed_out: u64,
    /// Tokens reported by workers.
    pub tokens_used: u64,
    /// Worker time reported by workers.
    pub duration_ms: u64,
}

/// Live workers and counters of one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryState {
    /// The category.
    pub category: TaskCategory,
    /// Tasks of this category with a live worker.
    pub running: BTreeSet<TaskId>,
    /// Counters since the monitor was created.
    pub metrics: WorkerMetrics,
}

#[derive(Default)]
struct MonitorState {
    categories: HashMap<TaskCategory, CategoryState>,
    high_water: usize,
}

impl MonitorState {
    fn running(&self) -> usize {
        self.categories.values().map(|s| s.running.len()).sum()
    }
}

/// Tracks live workers and per-category metrics for the whole run.
pub struct WorkerMonitor {
    state: Arc<RwLock<MonitorState>>,
}

impl WorkerMonitor {
    /// Monitor with every category present and idle.
    pub fn new() -> Self {
        let mut categories = HashMap::new();
        for category in TaskCategory::ALL {
            categories.insert(
                category,
                CategoryState {
                    category,
                    running: BTreeSet::new(),
                    metrics: WorkerMetrics::default(),
                },
            );
        }
        Self {
            state: Arc::new(RwLock::new(MonitorState {
                categories,
                high_water: 0,
            })),
        }
    }

    /// Record a worker launch.
    pub async fn start_task(&self, category: TaskCategory, task_id: TaskId) {
        let mut state = self.state.write().await;
        if let Some(s) = state.categories.get_mut(&category) {
            s.running.insert(task_id);
            s.metrics.dispatched += 1;
        }
        let running = state.running();
        state.high_water = state.high_water.max(running);
    }

    /// Record that a worker is gone, whatever the outcome.
    pub async fn finish_task(&self, category: TaskCategory, task_id: &TaskId) {
        let mut state = self.state.write().await;
        if let Some(s) = state.categories.get_mut(&category) {
            s.running.remove(task_id);
        }
    }

    /// Count a verdict and add its reported cost.
    pub async fn record_verdict(&self, category: TaskCategory, kind: VerdictKind, cost: Cost) {
        let mut state = self.state.write().await;
        if let Some(s) = state.categories.get_mut(&category) {
            match kind {
                VerdictKind::Pass => s.metrics.passed += 1,
                VerdictKind::Fail => s.metrics.failed += 1,
                VerdictKind::Blocked => s.metrics.blocked += 1,
            }
            s.metrics.tokens_used += cost.tokens;
            s.metrics.duration_ms += cost.duration_ms;
        }
    }

    /// Count a timeout. Timeouts also count as failures.
    pub async fn record_timeout(&self, category: TaskCategory) {
        let mut state = self.state.write().await;
        if let Some(s) = state.categories.get_mut(&category) {
            s.metrics.timed_out += 1;
            s.metrics.failed += 1;
        }
    }

    /// Workers currently running across all categories.
    pub async fn running_count(&self) -> usize {
        self.state.read().await.running()
    }

    /// Most workers ever observed running at once.
    pub async fn high_water(&self) -> usize {
        self.state.read().await.high_water
    }

    /// Per-category state, in category order.
    pub async fn snapshot(&self) -> Vec<CategoryState> {
        let state = self.state.read().await;
        let mut states: Vec<CategoryState> = state.categories.values().cloned().collect();
        states.sort_by_key(|s| s.category);
        states
    }

    /// State of one category.
    pub async fn get_state(&self, category: TaskCategory) -> Option<CategoryState> {
        self.state.read().await.categories.get(&category).cloned()
    }

    /// Counters summed over every category.
    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let state = self.state.read().await;
        let mut total = WorkerMetrics::default();
        for s in state.categories.values() {
            total.dispatched += s.metrics.dispatched;
            total.passed += s.metrics.passed;
            total.failed += s.metrics.failed;
            total.blocked += s.metrics.blocked;
            total.timed_out += s.metrics.timed_out;
            total.tokens_used += s.metrics.tokens_used;
            total.duration_ms += s.metrics.duration_ms;
        }
        total
    }

    /// Per-category and aggregate counters as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let categories = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "categories": categories,
            "aggregate": aggregate,
            "running": self.running_count().await,
            "high_water": self.high_water().await,
        })
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
