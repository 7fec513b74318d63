use crate::report::TaskProposal;
use conductor_core::{ConductorError, ConductorResult, TaskId};
use conductor_graph::{GraphStore, Task};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Tasks proposed by one worker, to be added under its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Task whose worker proposed them.
    pub parent: TaskId,
    /// The proposed tasks.
    pub proposals: Vec<TaskProposal>,
}

/// Adds worker-proposed tasks to the graph, enforcing depth and fan-out
/// limits to prevent runaway recursion.
pub struct TaskSpawner {
    /// Maximum depth in the proposal hierarchy (decomposed tasks are depth 0).
    max_depth: u32,
    /// Maximum number of tasks a single parent may propose over the run.
    max_children: u32,
    store: Arc<dyn GraphStore>,
}

impl TaskSpawner {
    /// Create a spawner with default limits (max_depth=3, max_children=10).
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            max_depth: 3,
            max_children: 10,
            store,
        }
    }

    /// Set the deepest allowed proposal level.
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the proposals allowed per parent.
    pub fn with_max_children(mut self, max: u32) -> Self {
        self.max_children = max;
        self
    }

    /// Add the proposed tasks as one batch. Nothing is added if any proposal
    /// is rejected.
    ///
    /// Fails if:
    /// - The parent task does not exist.
    /// - The depth limit would be exceeded.
    /// - The parent would exceed its fan-out limit.
    /// - A proposal depends on a task neither in the graph nor in the batch.
    /// - The batch would introduce a cycle or reuse an id.
    pub async fn spawn(&self, request: SpawnRequest) -> ConductorResult<Vec<TaskId>> {
        if request.proposals.is_empty() {
            return Ok(Vec::new());
        }
        let graph = self.store.snapshot().await?;

        let parent = graph.get(&request.parent).ok_or_else(|| {
            ConductorError::Decomposition(format!("parent task {} not found", request.parent))
        })?;
        if parent.depth + 1 > self.max_depth {
            return Err(ConductorError::Decomposition(format!(
                "maximum spawn depth {} exceeded (parent {} is at depth {})",
                self.max_depth, parent.id, parent.depth
            )));
        }

        let existing = graph.children_of(&request.parent).len();
        if existing + request.proposals.len() > self.max_children as usize {
            return Err(ConductorError::Decomposition(format!(
                "parent task {} would have {} children (max {})",
                request.parent,
                existing + request.proposals.len(),
                self.max_children
            )));
        }

        let batch: HashSet<&str> = request.proposals.iter().map(|p| p.id.as_str()).collect();
        let mut tasks = Vec::with_capacity(request.proposals.len());
        for proposal in &request.proposals {
            if proposal.id.trim().is_empty() || proposal.objective.trim().is_empty() {
                return Err(ConductorError::Decomposition(format!(
                    "proposal '{}' from {} needs an id and an objective",
                    proposal.id, request.parent
                )));
            }
            for dep in &proposal.depends_on {
                if !batch.contains(dep.as_str()) && !graph.contains(&TaskId::from(dep.as_str())) {
                    return Err(ConductorError::Decomposition(format!(
                        "proposal {} depends on unknown task {dep}",
                        proposal.id
                    )));
                }
            }

            let mut task = Task::new(
                proposal.id.as_str(),
                proposal.category,
                proposal.objective.as_str(),
            )
            .with_title(proposal.title.as_str())
            .with_complexity(proposal.complexity)
            .with_priority(proposal.priority)
            .with_acceptance_criteria(proposal.acceptance_criteria.iter().cloned())
            .with_dependencies(proposal.depends_on.iter().map(String::as_str));
            task.parent = Some(request.parent.clone());
            task.depth = parent.depth + 1;
            tasks.push(task);
        }

        let added = self.store.add_tasks(tasks).await?;
        info!(parent = %request.parent, count = added.len(), "Proposed tasks added");
        Ok(added)
    }

    /// IDs of all tasks proposed under `parent`.
    pub async fn children_of(&self, parent: &TaskId) -> ConductorResult<Vec<TaskId>> {
        let graph = self.store.snapshot().await?;
        Ok(graph
            .children_of(parent)
            .into_iter()
            .map(|t| t.id.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::{Complexity, Priority, TaskCategory};
    use conductor_graph::MemoryGraphStore;

    fn proposal(id: &str, deps: &[&str]) -> TaskProposal {
        TaskProposal {
            id: id.to_string(),
            title: format!("Task {id}"),
            category: TaskCategory::Build,
            objective: format!("do {id}"),
            acceptance_criteria: vec![],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            complexity: Complexity::Easy,
            priority: Priority::Medium,
        }
    }

    async fn setup() -> (Arc<MemoryGraphStore>, TaskId) {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .add_tasks(vec![Task::new("RESEARCH-001", TaskCategory::Research, "look around")])
            .await
            .unwrap();
        (store, "RESEARCH-001".into())
    }

    #[tokio::test]
    async fn test_spawn_adds_children() {
        let (store, root) = setup().await;
        let spawner = TaskSpawner::new(store.clone());

        let added = spawner
            .spawn(SpawnRequest {
                parent: root.clone(),
                proposals: vec![proposal("BUILD-101", &[]), proposal("BUILD-102", &["BUILD-101"])],
            })
            .await
            .unwrap();
        assert_eq!(added.len(), 2);

        let child = store.get(&"BUILD-102".into()).await.unwrap().unwrap();
        assert_eq!(child.parent, Some(root.clone()));
        assert_eq!(child.depth, 1);
        assert!(child.dependencies.contains(&TaskId::from("BUILD-101")));
        assert_eq!(spawner.children_of(&root).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let (store, root) = setup().await;
        let spawner = TaskSpawner::new(store).with_max_depth(1);
        spawner
            .spawn(SpawnRequest {
                parent: root,
                proposals: vec![proposal("L1", &[])],
            })
            .await
            .unwrap();

        let err = spawner
            .spawn(SpawnRequest {
                parent: "L1".into(),
                proposals: vec![proposal("L2", &[])],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[tokio::test]
    async fn test_fan_out_limit_rejects_whole_batch() {
        let (store, root) = setup().await;
        let spawner = TaskSpawner::new(store.clone()).with_max_children(2);

        let err = spawner
            .spawn(SpawnRequest {
                parent: root,
                proposals: vec![proposal("A", &[]), proposal("B", &[]), proposal("C", &[])],
            })
            .await
            .unwrap_err();
        assert!(!err.is_integrity());
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_not_integrity_error() {
        let (store, root) = setup().await;
        let spawner = TaskSpawner::new(store.clone());

        let err = spawner
            .spawn(SpawnRequest {
                parent: root,
                proposals: vec![proposal("A", &["NOPE"])],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Decomposition(_)));
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cyclic_batch_rejected() {
        let (store, root) = setup().await;
        let spawner = TaskSpawner::new(store.clone());

        let err = spawner
            .spawn(SpawnRequest {
                parent: root,
                proposals: vec![proposal("A", &["B"]), proposal("B", &["A"])],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Cycle(_)));
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }
}
