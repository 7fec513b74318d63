use crate::executor::{AgentExecutor, ExecutionContext};
use crate::gate::SlotHandle;
use crate::monitor::WorkerMonitor;
use crate::profiles::{BudgetTable, ExecutionBudget, WorkerProfile};
use crate::report::CompletionRecord;
use crate::signal::{FileSignalChannel, WaitOutcome};
use conductor_core::{AttemptId, ConductorError, ConductorResult, TaskCategory, TaskId, TaskStatus};
use conductor_graph::{FailureKind, GraphStore, StatusUpdate, Task, TaskFailure};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Completion wait state machine of one dispatched attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// Worker launched, no wait started yet.
    Dispatched,
    /// Polling for the completion record.
    Waiting,
    /// Completion record found.
    Signaled,
    /// Record taken for verification.
    Collected,
    /// Budget expired before a record arrived.
    TimedOut,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPhase::Dispatched => write!(f, "dispatched"),
            WaitPhase::Waiting => write!(f, "waiting"),
            WaitPhase::Signaled => write!(f, "signaled"),
            WaitPhase::Collected => write!(f, "collected"),
            WaitPhase::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Identifies the run and loop a dispatch belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run the attempt belongs to.
    pub run_id: String,
    /// Loop that dispatched it.
    pub loop_number: u32,
}

/// A launched attempt. Owns the gate slot until the attempt is collected.
pub struct DispatchTicket {
    /// Task as claimed, now `in_progress`.
    pub task: Task,
    /// Attempt id issued by the claim.
    pub attempt: AttemptId,
    /// Attempt's working directory.
    pub output_dir: PathBuf,
    /// Budget the worker runs under.
    pub budget: ExecutionBudget,
    /// When the worker was launched.
    pub dispatched_at: Instant,
    slot: SlotHandle,
}

/// Result of one dispatch call.
pub enum DispatchOutcome {
    /// A worker is running for the ticket's attempt.
    Launched(DispatchTicket),
    /// The task was no longer pending; nothing was spawned.
    AlreadyClaimed,
    /// The executor could not start the worker. The task is now failed.
    LaunchFailed {
        /// Task as it was claimed.
        task: Task,
        /// Executor error.
        error: String,
    },
}

/// How an attempt ended, from the dispatcher's point of view.
#[derive(Debug)]
pub enum Collection {
    /// The worker signaled; the record still needs verification.
    Signaled {
        /// Task as it was claimed.
        task: Task,
        /// Attempt that signaled.
        attempt: AttemptId,
        /// The worker's completion record.
        record: CompletionRecord,
        /// Where the evidence lives.
        output_dir: PathBuf,
        /// Time from launch to collection.
        elapsed: Duration,
    },
    /// No signal within the budget. The task has been failed.
    TimedOut {
        /// Task as it was claimed.
        task: Task,
        /// Attempt that never signaled.
        attempt: AttemptId,
        /// Budget that expired.
        timeout: Duration,
    },
    /// The wait itself broke (unreadable signal directory). The task has been failed.
    Abandoned {
        /// Task as it was claimed.
        task: Task,
        /// Attempt being waited on.
        attempt: AttemptId,
        /// Why the wait broke.
        error: String,
    },
}

impl Collection {
    /// Task the attempt belonged to.
    pub fn task(&self) -> &Task {
        match self {
            Collection::Signaled { task, .. }
            | Collection::TimedOut { task, .. }
            | Collection::Abandoned { task, .. } => task,
        }
    }
}

/// Claims eligible tasks and launches exactly one worker per claim.
pub struct Dispatcher {
    store: Arc<dyn GraphStore>,
    executor: Arc<dyn AgentExecutor>,
    signals: Arc<FileSignalChannel>,
    profiles: HashMap<TaskCategory, WorkerProfile>,
    budgets: BudgetTable,
    work_dir: PathBuf,
    monitor: Option<Arc<WorkerMonitor>>,
}

impl Dispatcher {
    /// Dispatcher with no monitor attached.
    pub fn new(
        store: Arc<dyn GraphStore>,
        executor: Arc<dyn AgentExecutor>,
        signals: Arc<FileSignalChannel>,
        profiles: HashMap<TaskCategory, WorkerProfile>,
        budgets: BudgetTable,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            executor,
            signals,
            profiles,
            budgets,
            work_dir,
            monitor: None,
        }
    }

    /// Track live workers in `monitor`. A worker is counted only while it
    /// holds its gate slot.
    pub fn with_monitor(mut self, monitor: Arc<WorkerMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn profile_for(&self, category: TaskCategory) -> WorkerProfile {
        self.profiles
            .get(&category)
            .cloned()
            .unwrap_or_else(|| WorkerProfile {
                category,
                system_prompt: String::new(),
                allowed_tools: Vec::new(),
                max_turns: 30,
            })
    }

    /// Claim `task_id` (pending -> in_progress under a fresh attempt) and
    /// launch its worker. The slot travels with the ticket.
    pub async fn dispatch(
        &self,
        task_id: &TaskId,
        run: &RunContext,
        slot: SlotHandle,
    ) -> ConductorResult<DispatchOutcome> {
        let attempt = match self.store.begin_attempt(task_id).await {
            Ok(attempt) => attempt,
            Err(ConductorError::StatusConflict { actual, .. }) => {
                debug!(task_id = %task_id, status = %actual, "Task already claimed");
                return Ok(DispatchOutcome::AlreadyClaimed);
            }
            Err(e) => return Err(e),
        };
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| ConductorError::UnknownTask(task_id.clone()))?;

        let output_dir = self
            .work_dir
            .join(task_id.as_str())
            .join(attempt.to_string());
        let budget = self.budgets.for_complexity(task.complexity);
        let ctx = ExecutionContext::new(
            run.run_id.clone(),
            run.loop_number,
            attempt,
            task.clone(),
            output_dir.clone(),
            self.profile_for(task.category),
            budget,
            self.signals.clone(),
        );

        let launched = match tokio::fs::create_dir_all(&output_dir).await {
            Ok(()) => self.executor.launch(ctx).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = launched {
            warn!(task_id = %task_id, attempt = %attempt, error = %e, "Worker launch failed");
            let failed = self
                .store
                .apply(
                    task_id,
                    StatusUpdate::new(TaskStatus::Failed, "worker launch failed")
                        .expecting(TaskStatus::InProgress)
                        .for_attempt(attempt)
                        .failed_with(TaskFailure::new(FailureKind::LaunchFailed, e.to_string())),
                )
                .await?;
            drop(slot);
            return Ok(DispatchOutcome::LaunchFailed {
                task: failed,
                error: e.to_string(),
            });
        }

        if let Some(monitor) = &self.monitor {
            monitor.start_task(task.category, task.id.clone()).await;
        }
        info!(
            task_id = %task_id,
            attempt = %attempt,
            category = %task.category,
            complexity = %task.complexity,
            timeout_ms = budget.timeout.as_millis() as u64,
            phase = %WaitPhase::Dispatched,
            "Worker dispatched"
        );
        Ok(DispatchOutcome::Launched(DispatchTicket {
            task,
            attempt,
            output_dir,
            budget,
            dispatched_at: Instant::now(),
            slot,
        }))
    }

    /// Wait once, bounded by the attempt's budget, then release the slot.
    pub async fn await_completion(&self, ticket: DispatchTicket) -> ConductorResult<Collection> {
        let DispatchTicket {
            task,
            attempt,
            output_dir,
            budget,
            dispatched_at,
            slot,
        } = ticket;
        debug!(
            task_id = %task.id,
            attempt = %attempt,
            phase = %WaitPhase::Waiting,
            "Awaiting completion"
        );

        let waited = self.signals.wait(&task.id, attempt, budget.timeout).await;
        if let Some(monitor) = &self.monitor {
            monitor.finish_task(task.category, &task.id).await;
        }
        drop(slot);

        match waited {
            Ok(WaitOutcome::Signaled(record)) => {
                debug!(
                    task_id = %task.id,
                    attempt = %attempt,
                    phase = %WaitPhase::Signaled,
                    "Completion signaled"
                );
                let elapsed = dispatched_at.elapsed();
                info!(
                    task_id = %task.id,
                    attempt = %attempt,
                    claimed = ?record.report.outcome,
                    elapsed_ms = elapsed.as_millis() as u64,
                    phase = %WaitPhase::Collected,
                    "Completion collected"
                );
                Ok(Collection::Signaled {
                    task,
                    attempt,
                    record,
                    output_dir,
                    elapsed,
                })
            }
            Ok(WaitOutcome::TimedOut) => {
                let timeout = budget.timeout;
                let error = ConductorError::DispatchTimeout {
                    task: task.id.clone(),
                    timeout,
                };
                warn!(
                    task_id = %task.id,
                    attempt = %attempt,
                    phase = %WaitPhase::TimedOut,
                    "{error}"
                );
                let detail = error.to_string();
                self.fail_attempt(&task.id, attempt, FailureKind::DispatchTimeout, &detail)
                    .await?;
                Ok(Collection::TimedOut {
                    task,
                    attempt,
                    timeout,
                })
            }
            Err(e) => {
                warn!(task_id = %task.id, attempt = %attempt, error = %e, "Completion wait failed");
                self.fail_attempt(&task.id, attempt, FailureKind::WorkerOrphaned, &e.to_string())
                    .await?;
                Ok(Collection::Abandoned {
                    task,
                    attempt,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Fail `attempt` of `task_id`. See [`fail_attempt`].
    pub async fn fail_attempt(
        &self,
        task_id: &TaskId,
        attempt: AttemptId,
        kind: FailureKind,
        detail: &str,
    ) -> ConductorResult<()> {
        fail_attempt(self.store.as_ref(), task_id, attempt, kind, detail).await
    }
}

/// Fail the current attempt of an in-progress task. A conflict means the
/// attempt was already settled and is not an error.
pub async fn fail_attempt(
    store: &dyn GraphStore,
    task_id: &TaskId,
    attempt: AttemptId,
    kind: FailureKind,
    detail: &str,
) -> ConductorResult<()> {
    let update = StatusUpdate::new(TaskStatus::Failed, kind.to_string())
        .expecting(TaskStatus::InProgress)
        .for_attempt(attempt)
        .failed_with(TaskFailure::new(kind, detail));
    match store.apply(task_id, update).await {
        Ok(_) => Ok(()),
        Err(ConductorError::StatusConflict { actual, .. }) => {
            debug!(task_id = %task_id, status = %actual, "Attempt already settled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gate::ConcurrencyGate;
    use crate::profiles::{default_profiles, profile_map};
    use crate::report::WorkerReport;
    use async_trait::async_trait;
    use conductor_core::TaskCategory;
    use conductor_graph::MemoryGraphStore;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records contexts; completes immediately when `auto_complete` is set.
    struct RecordingExecutor {
        launched: Mutex<Vec<ExecutionContext>>,
        auto_complete: bool,
    }

    #[async_trait]
    impl AgentExecutor for RecordingExecutor {
        async fn launch(&self, ctx: ExecutionContext) -> ConductorResult<()> {
            if self.auto_complete {
                ctx.complete(WorkerReport::success("done")).await?;
            }
            self.launched.lock().push(ctx);
            Ok(())
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl AgentExecutor for BrokenExecutor {
        async fn launch(&self, _ctx: ExecutionContext) -> ConductorResult<()> {
            Err(ConductorError::Executor("no worker binary".into()))
        }
    }

    async fn setup(
        executor: Arc<dyn AgentExecutor>,
        timeout: Duration,
    ) -> (TempDir, Arc<MemoryGraphStore>, Dispatcher) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryGraphStore::new());
        store
            .add_tasks(vec![Task::new("T1", TaskCategory::Build, "build")])
            .await
            .unwrap();
        let signals = Arc::new(FileSignalChannel::open(tmp.path().join("complete")).await.unwrap());
        let budgets = BudgetTable::from_config(
            &crate::config::BudgetConfig::default().with_uniform_timeout(timeout),
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            executor,
            signals,
            profile_map(default_profiles()),
            budgets,
            tmp.path().join("work"),
        );
        (tmp, store, dispatcher)
    }

    fn run() -> RunContext {
        RunContext {
            run_id: "run-test".into(),
            loop_number: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_launches_one_worker() {
        let executor = Arc::new(RecordingExecutor {
            launched: Mutex::new(Vec::new()),
            auto_complete: false,
        });
        let (_tmp, _store, dispatcher) = setup(executor.clone(), Duration::from_secs(1)).await;
        let dispatcher = Arc::new(dispatcher);
        let gate = ConcurrencyGate::new(8).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            let slot = gate.acquire().await.unwrap();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch(&"T1".into(), &run(), slot).await
            }));
        }

        let mut launched = Vec::new();
        for handle in handles {
            if let DispatchOutcome::Launched(ticket) = handle.await.unwrap().unwrap() {
                launched.push(ticket);
            }
        }
        assert_eq!(launched.len(), 1);
        assert_eq!(executor.launched.lock().len(), 1);
        // Losers gave their slots back.
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test]
    async fn test_signaled_attempt_is_collected() {
        let executor = Arc::new(RecordingExecutor {
            launched: Mutex::new(Vec::new()),
            auto_complete: true,
        });
        let (_tmp, _store, dispatcher) = setup(executor, Duration::from_secs(5)).await;
        let gate = ConcurrencyGate::new(1).unwrap();
        let slot = gate.acquire().await.unwrap();

        let DispatchOutcome::Launched(ticket) =
            dispatcher.dispatch(&"T1".into(), &run(), slot).await.unwrap()
        else {
            panic!("expected launch");
        };
        assert!(ticket.output_dir.exists());
        let collection = dispatcher.await_completion(ticket).await.unwrap();
        assert!(matches!(collection, Collection::Signaled { .. }));
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_task_and_frees_slot() {
        let executor = Arc::new(RecordingExecutor {
            launched: Mutex::new(Vec::new()),
            auto_complete: false,
        });
        let (_tmp, store, dispatcher) = setup(executor, Duration::from_millis(50)).await;
        let gate = ConcurrencyGate::new(1).unwrap();
        let slot = gate.acquire().await.unwrap();

        let DispatchOutcome::Launched(ticket) =
            dispatcher.dispatch(&"T1".into(), &run(), slot).await.unwrap()
        else {
            panic!("expected launch");
        };
        let collection = dispatcher.await_completion(ticket).await.unwrap();
        assert!(matches!(collection, Collection::TimedOut { .. }));

        let task = store.get(&"T1".into()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure.unwrap().kind, FailureKind::DispatchTimeout);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_launch_failure_fails_task() {
        let (_tmp, store, dispatcher) =
            setup(Arc::new(BrokenExecutor), Duration::from_secs(1)).await;
        let gate = ConcurrencyGate::new(1).unwrap();
        let slot = gate.acquire().await.unwrap();

        let outcome = dispatcher.dispatch(&"T1".into(), &run(), slot).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::LaunchFailed { .. }));
        let task = store.get(&"T1".into()).await.unwrap().unwrap();
        assert_eq!(task.failure.unwrap().kind, FailureKind::LaunchFailed);
        assert_eq!(gate.available(), 1);
    }
}
