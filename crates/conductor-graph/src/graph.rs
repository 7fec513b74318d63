use crate::task::{BlockReason, StatusChange, Task, TaskFailure};
use chrono::Utc;
use conductor_core::{AttemptId, ConductorError, ConductorResult, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A requested status change, optionally guarded by compare-and-set conditions.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Target status.
    pub to: TaskStatus,
    /// Recorded in the task's history.
    pub reason: String,
    /// Fail with `StatusConflict` unless the task is currently in this status.
    pub expected: Option<TaskStatus>,
    /// Fail with `StatusConflict` unless this is the task's current attempt.
    pub expected_attempt: Option<AttemptId>,
    /// Attempt to record when moving to `in_progress`.
    pub new_attempt: Option<AttemptId>,
    /// Recorded when moving to `blocked`.
    pub block_reason: Option<BlockReason>,
    /// Recorded when moving to `failed`.
    pub failure: Option<TaskFailure>,
}

impl StatusUpdate {
    /// Unconditional change to `to`.
    pub fn new(to: TaskStatus, reason: impl Into<String>) -> Self {
        Self {
            to,
            reason: reason.into(),
            expected: None,
            expected_attempt: None,
            new_attempt: None,
            block_reason: None,
            failure: None,
        }
    }

    /// Require the task to be in `status`.
    pub fn expecting(mut self, status: TaskStatus) -> Self {
        self.expected = Some(status);
        self
    }

    /// Require `attempt` to be the task's current attempt.
    pub fn for_attempt(mut self, attempt: AttemptId) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }

    /// Record `attempt` as the new current attempt.
    pub fn starting_attempt(mut self, attempt: AttemptId) -> Self {
        self.new_attempt = Some(attempt);
        self
    }

    /// Record why the task is blocked.
    pub fn blocked_by(mut self, reason: BlockReason) -> Self {
        self.block_reason = Some(reason);
        self
    }

    /// Record why the task failed.
    pub fn failed_with(mut self, failure: TaskFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Number of active tasks per status. Superseded tasks are counted apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Waiting on dependencies or a free slot.
    pub pending: usize,
    /// Dispatched and awaiting a verdict.
    pub in_progress: usize,
    /// Passed verification.
    pub completed: usize,
    /// Failed and not superseded.
    pub failed: usize,
    /// Blocked on the environment or a dependency.
    pub blocked: usize,
    /// Failed tasks that have been replaced by a remediation task.
    pub superseded: usize,
}

impl StatusCounts {
    /// Active tasks across all statuses.
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.blocked
    }
}

/// All tasks plus their dependency edges.
///
/// The graph owns referential integrity: every dependency and every
/// `supersedes` link names a task in the graph, and the dependency relation is
/// acyclic. Tasks are never removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    next_seq: u64,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks, superseded ones included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look up a task.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Whether a task with `id` exists.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Add a batch of tasks. All-or-nothing: on any error the graph is unchanged.
    pub fn add_all(&mut self, tasks: Vec<Task>) -> ConductorResult<Vec<TaskId>> {
        let mut staged = self.clone();
        let mut added = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            if staged.tasks.contains_key(&task.id) {
                return Err(ConductorError::DuplicateTask(task.id));
            }
            task.seq = staged.next_seq;
            staged.next_seq += 1;
            added.push(task.id.clone());
            staged.tasks.insert(task.id.clone(), task);
        }

        for id in &added {
            let Some(task) = staged.tasks.get(id) else {
                continue;
            };
            let links = task.dependencies.iter().chain(task.supersedes.iter());
            for dep in links {
                if !staged.tasks.contains_key(dep) {
                    return Err(ConductorError::DanglingDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = staged.find_cycle() {
            return Err(ConductorError::Cycle(cycle));
        }

        *self = staged;
        Ok(added)
    }

    /// Whether the dependency relation contains a cycle.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// One dependency cycle, as a path that starts and ends on the same task.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited = HashMap::new();
        let mut stack = Vec::new();
        for id in self.tasks.keys() {
            if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a TaskId,
        visited: &mut HashMap<&'a TaskId, u8>,
        stack: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        match visited.get(id) {
            Some(1) => {
                // back edge
                let start = stack.iter().position(|s| s == id).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(id.clone());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }
        visited.insert(id, 1);
        stack.push(id.clone());
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                if let Some(cycle) = self.dfs_cycle(dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        visited.insert(id, 2);
        None
    }

    fn successors(&self) -> HashMap<&TaskId, &TaskId> {
        self.tasks
            .values()
            .filter_map(|t| t.supersedes.as_ref().map(|old| (old, &t.id)))
            .collect()
    }

    fn resolve<'a>(
        &'a self,
        id: &'a TaskId,
        successors: &HashMap<&'a TaskId, &'a TaskId>,
    ) -> &'a TaskId {
        let mut current = id;
        // A chain can never be longer than the graph.
        for _ in 0..=self.tasks.len() {
            match successors.get(current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    /// The task that currently stands for `id`: `id` itself, or the newest
    /// remediation task in its `supersedes` chain.
    pub fn effective(&self, id: &TaskId) -> Option<&Task> {
        let successors = self.successors();
        self.tasks.get(self.resolve(id, &successors))
    }

    /// Whether a remediation task has replaced `id`.
    pub fn is_superseded(&self, id: &TaskId) -> bool {
        self.tasks
            .values()
            .any(|t| t.supersedes.as_ref() == Some(id))
    }

    /// Root of a remediation chain and the number of attempts made so far.
    pub fn remediation_chain(&self, id: &TaskId) -> (TaskId, u32) {
        let mut root = id.clone();
        let mut attempts = 1;
        for _ in 0..self.tasks.len() {
            match self.tasks.get(&root).and_then(|t| t.supersedes.clone()) {
                Some(previous) => {
                    root = previous;
                    attempts += 1;
                }
                None => break,
            }
        }
        (root, attempts)
    }

    fn satisfied<'a>(
        &'a self,
        successors: &HashMap<&'a TaskId, &'a TaskId>,
    ) -> HashSet<&'a TaskId> {
        self.tasks
            .keys()
            .filter(|id| {
                let effective = self.resolve(id, successors);
                self.tasks
                    .get(effective)
                    .is_some_and(|t| t.status == TaskStatus::Completed)
            })
            .collect()
    }

    /// Pending tasks whose dependencies have all completed, ordered by
    /// downstream depth (longest chain first), then priority, then insertion.
    pub fn eligible(&self) -> Vec<&Task> {
        let successors = self.successors();
        let satisfied = self.satisfied(&successors);
        let depths = self.longest_chains(&successors);
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| !successors.contains_key(&t.id) && t.is_ready(&satisfied))
            .collect();
        ready.sort_by(|a, b| {
            let da = depths.get(&a.id).copied().unwrap_or(0);
            let db = depths.get(&b.id).copied().unwrap_or(0);
            db.cmp(&da)
                .then(a.priority.cmp(&b.priority))
                .then(a.seq.cmp(&b.seq))
        });
        ready
    }

    /// Active tasks with a dependency that resolves to `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        let successors = self.successors();
        let mut found: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| !successors.contains_key(&t.id))
            .filter(|t| {
                t.dependencies
                    .iter()
                    .any(|dep| self.resolve(dep, &successors) == id)
            })
            .collect();
        found.sort_by_key(|t| t.seq);
        found
    }

    /// Effective statuses of a task's dependencies.
    pub fn dependency_states(&self, id: &TaskId) -> Vec<(TaskId, TaskStatus)> {
        let successors = self.successors();
        self.tasks
            .get(id)
            .map(|task| {
                task.dependencies
                    .iter()
                    .filter_map(|dep| {
                        let effective = self.resolve(dep, &successors);
                        self.tasks
                            .get(effective)
                            .map(|t| (t.id.clone(), t.status))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks proposed by the worker of `parent`.
    pub fn children_of(&self, parent: &TaskId) -> Vec<&Task> {
        let mut children: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.parent.as_ref() == Some(parent))
            .collect();
        children.sort_by_key(|t| t.seq);
        children
    }

    /// For every unresolved active task, the number of tasks on the longest
    /// chain of unresolved dependents starting at it (itself included).
    fn longest_chains<'a>(
        &'a self,
        successors: &HashMap<&'a TaskId, &'a TaskId>,
    ) -> HashMap<&'a TaskId, usize> {
        let unresolved = |t: &Task| {
            t.status != TaskStatus::Completed && !successors.contains_key(&t.id)
        };

        let mut downstream: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for task in self.tasks.values().filter(|t| unresolved(t)) {
            downstream.entry(&task.id).or_default();
            for dep in &task.dependencies {
                let effective = self.resolve(dep, successors);
                if self.tasks.get(effective).is_some_and(|t| unresolved(t)) {
                    downstream.entry(effective).or_default().push(&task.id);
                }
            }
        }

        let mut memo = HashMap::new();
        let ids: Vec<&TaskId> = downstream.keys().copied().collect();
        for id in ids {
            Self::chain_len(id, &downstream, &mut memo);
        }
        memo
    }

    fn chain_len<'a>(
        id: &'a TaskId,
        downstream: &HashMap<&'a TaskId, Vec<&'a TaskId>>,
        memo: &mut HashMap<&'a TaskId, usize>,
    ) -> usize {
        if let Some(len) = memo.get(id) {
            return *len;
        }
        let mut longest = 0;
        if let Some(children) = downstream.get(id) {
            for child in children {
                longest = longest.max(Self::chain_len(*child, downstream, memo));
            }
        }
        memo.insert(id, longest + 1);
        longest + 1
    }

    /// Number of unresolved tasks that transitively wait on `id`, along the
    /// longest chain. Scheduling hint only.
    pub fn downstream_depth(&self, id: &TaskId) -> usize {
        let successors = self.successors();
        self.longest_chains(&successors)
            .get(id)
            .map(|len| len.saturating_sub(1))
            .unwrap_or(0)
    }

    /// Longest chain of unresolved tasks, upstream first.
    pub fn critical_path(&self) -> Vec<TaskId> {
        let successors = self.successors();
        let chains = self.longest_chains(&successors);
        let by_rank = |a: &&TaskId, b: &&TaskId| {
            let la = chains.get(*a).copied().unwrap_or(0);
            let lb = chains.get(*b).copied().unwrap_or(0);
            let sa = self.tasks.get(*a).map(|t| t.seq).unwrap_or(u64::MAX);
            let sb = self.tasks.get(*b).map(|t| t.seq).unwrap_or(u64::MAX);
            la.cmp(&lb).then(sb.cmp(&sa))
        };

        let Some(mut current) = chains.keys().copied().max_by(by_rank) else {
            return Vec::new();
        };
        let mut path = vec![current.clone()];
        loop {
            let next = self
                .dependents(current)
                .into_iter()
                .map(|t| &t.id)
                .filter(|id| chains.contains_key(id))
                .max_by(by_rank);
            match next {
                Some(id) => {
                    path.push(id.clone());
                    current = id;
                }
                None => break,
            }
        }
        path
    }

    /// Apply a status change, enforcing the compare-and-set guards and the
    /// legal transition table. Returns the updated task.
    pub fn apply(&mut self, id: &TaskId, update: StatusUpdate) -> ConductorResult<Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ConductorError::UnknownTask(id.clone()))?;
        let from = task.status;

        if let Some(expected) = update.expected {
            if from != expected {
                return Err(ConductorError::StatusConflict {
                    id: id.clone(),
                    expected: expected.to_string(),
                    actual: from.to_string(),
                });
            }
        }
        if let Some(expected) = update.expected_attempt {
            if task.attempt != Some(expected) {
                return Err(ConductorError::StatusConflict {
                    id: id.clone(),
                    expected: format!("attempt {expected}"),
                    actual: task
                        .attempt
                        .map(|a| format!("attempt {a}"))
                        .unwrap_or_else(|| "no attempt".to_string()),
                });
            }
        }
        if !from.can_transition_to(update.to) {
            return Err(ConductorError::InvalidTransition {
                id: id.clone(),
                from,
                to: update.to,
            });
        }

        match update.to {
            TaskStatus::InProgress => {
                task.attempt = update.new_attempt.or(task.attempt);
            }
            TaskStatus::Pending => {
                if matches!(task.block_reason, Some(BlockReason::Environment { .. })) {
                    task.environment_rescans += 1;
                }
                task.block_reason = None;
            }
            TaskStatus::Blocked => task.block_reason = update.block_reason,
            TaskStatus::Failed => task.failure = update.failure,
            TaskStatus::Completed => {}
        }

        let now = Utc::now();
        task.status = update.to;
        task.updated_at = now;
        task.history.push(StatusChange {
            from,
            to: update.to,
            at: now,
            reason: update.reason,
        });
        Ok(task.clone())
    }

    /// Status counts over active (non-superseded) tasks.
    pub fn counts(&self) -> StatusCounts {
        let successors = self.successors();
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            if successors.contains_key(&task.id) {
                counts.superseded += 1;
                continue;
            }
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// Active tasks currently in `status`, in insertion order.
    pub fn active_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        let successors = self.successors();
        let mut found: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == status && !successors.contains_key(&t.id))
            .collect();
        found.sort_by_key(|t| t.seq);
        found
    }
}
