use crate::graph::{StatusUpdate, TaskGraph};
use crate::markdown::render_task_queue;
use crate::task::Task;
use async_trait::async_trait;
use conductor_core::persist::{read_json, write_atomic, write_json};
use conductor_core::{AttemptId, ConductorResult, TaskId, TaskStatus};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Authoritative store of the task graph.
///
/// Every status write funnels through [`GraphStore::apply`], which holds the
/// store's lock for the whole check-and-write, so compare-and-set updates can
/// never be lost.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// A consistent copy of the whole graph.
    async fn snapshot(&self) -> ConductorResult<TaskGraph>;

    /// Add a batch of tasks. All-or-nothing.
    async fn add_tasks(&self, tasks: Vec<Task>) -> ConductorResult<Vec<TaskId>>;

    /// Apply one guarded status change.
    async fn apply(&self, id: &TaskId, update: StatusUpdate) -> ConductorResult<Task>;

    /// One task, if it exists.
    async fn get(&self, id: &TaskId) -> ConductorResult<Option<Task>> {
        Ok(self.snapshot().await?.get(id).cloned())
    }

    /// Tasks eligible for dispatch, in dispatch order.
    async fn eligible(&self) -> ConductorResult<Vec<Task>> {
        let graph = self.snapshot().await?;
        Ok(graph.eligible().into_iter().cloned().collect())
    }

    /// Unguarded status change.
    async fn mark_status(
        &self,
        id: &TaskId,
        to: TaskStatus,
        reason: &str,
    ) -> ConductorResult<Task> {
        self.apply(id, StatusUpdate::new(to, reason)).await
    }

    /// Status change guarded on the current status.
    async fn compare_and_set(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        to: TaskStatus,
        reason: &str,
    ) -> ConductorResult<Task> {
        self.apply(id, StatusUpdate::new(to, reason).expecting(expected))
            .await
    }

    /// Move a pending task to `in_progress` under a fresh attempt id.
    async fn begin_attempt(&self, id: &TaskId) -> ConductorResult<AttemptId> {
        let attempt = uuid::Uuid::new_v4();
        self.apply(
            id,
            StatusUpdate::new(TaskStatus::InProgress, "dispatched")
                .expecting(TaskStatus::Pending)
                .starting_attempt(attempt),
        )
        .await?;
        Ok(attempt)
    }
}

/// In-memory graph store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryGraphStore {
    graph: RwLock<TaskGraph>,
}

impl MemoryGraphStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `graph`.
    pub fn with_graph(graph: TaskGraph) -> Self {
        Self {
            graph: RwLock::new(graph),
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn snapshot(&self) -> ConductorResult<TaskGraph> {
        Ok(self.graph.read().await.clone())
    }

    async fn add_tasks(&self, tasks: Vec<Task>) -> ConductorResult<Vec<TaskId>> {
        self.graph.write().await.add_all(tasks)
    }

    async fn apply(&self, id: &TaskId, update: StatusUpdate) -> ConductorResult<Task> {
        self.graph.write().await.apply(id, update)
    }
}

/// File-backed graph store.
///
/// The graph lives in `graph.json` under the state directory. Each mutation is
/// applied to a copy, written with [`write_json`] (temp file, fsync, rename)
/// and only then swapped into memory, so nothing observable is ever ahead of
/// disk. A human-readable `task_queue.md` is re-rendered after each write.
pub struct FileGraphStore {
    dir: PathBuf,
    graph: Mutex<TaskGraph>,
}

impl FileGraphStore {
    /// Graph file name under the state directory.
    pub const GRAPH_FILE: &'static str = "graph.json";
    /// Rendered task queue file name.
    pub const QUEUE_FILE: &'static str = "task_queue.md";

    /// Open the store in `dir`, loading `graph.json` if present.
    pub async fn open(dir: impl Into<PathBuf>) -> ConductorResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let graph: TaskGraph = read_json(&dir.join(Self::GRAPH_FILE))
            .await?
            .unwrap_or_default();
        debug!(dir = %dir.display(), tasks = graph.len(), "Graph store opened");
        Ok(Self {
            dir,
            graph: Mutex::new(graph),
        })
    }

    /// State directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `graph.json`.
    pub fn graph_path(&self) -> PathBuf {
        self.dir.join(Self::GRAPH_FILE)
    }

    /// Path of `task_queue.md`.
    pub fn queue_path(&self) -> PathBuf {
        self.dir.join(Self::QUEUE_FILE)
    }

    async fn mutate<R, F>(&self, f: F) -> ConductorResult<R>
    where
        F: FnOnce(&mut TaskGraph) -> ConductorResult<R> + Send,
        R: Send,
    {
        let mut current = self.graph.lock().await;
        let mut next = current.clone();
        let result = f(&mut next)?;

        write_json(&self.graph_path(), &next).await?;
        let view = render_task_queue(&next);
        if let Err(e) = write_atomic(&self.queue_path(), view.as_bytes()).await {
            warn!(error = %e, "Failed to render task queue view");
        }

        *current = next;
        Ok(result)
    }
}

#[async_trait]
impl GraphStore for FileGraphStore {
    async fn snapshot(&self) -> ConductorResult<TaskGraph> {
        Ok(self.graph.lock().await.clone())
    }

    async fn add_tasks(&self, tasks: Vec<Task>) -> ConductorResult<Vec<TaskId>> {
        self.mutate(|graph| graph.add_all(tasks)).await
    }

    async fn apply(&self, id: &TaskId, update: StatusUpdate) -> ConductorResult<Task> {
        self.mutate(|graph| graph.apply(id, update)).await
    }
}
