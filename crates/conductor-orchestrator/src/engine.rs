use crate::config::OrchestratorConfig;
use crate::dispatcher::{fail_attempt, Collection, DispatchOutcome, Dispatcher, RunContext};
use crate::executor::{AgentExecutor, CommandExecutor};
use crate::gate::ConcurrencyGate;
use crate::monitor::WorkerMonitor;
use crate::profiles::{default_profiles, profile_map, BudgetTable, WorkerProfile};
use crate::report::CompletionRecord;
use crate::run::{LoopRecord, RunState, RunStatus, RunStore};
use crate::signal::FileSignalChannel;
use crate::spawner::{SpawnRequest, TaskSpawner};
use crate::verify::{CommandCheck, IndependentCheck, VerificationPipeline};
use conductor_core::{
    AttemptId, ConductorError, ConductorResult, Cost, TaskCategory, TaskId, TaskStatus,
    VerdictKind,
};
use conductor_graph::{
    render_task_queue, BlockReason, FailureKind, FileGraphStore, GraphStore, SpecDocument,
    StatusCounts, StatusUpdate, Task, TaskFailure,
};
use conductor_ledger::{FileLedger, LedgerEntry, LedgerStore};
use conductor_security::{AuditLog, AuditOutcome};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Assembles an [`Orchestrator`] over a state directory.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    executor: Option<Arc<dyn AgentExecutor>>,
    checks: Vec<Arc<dyn IndependentCheck>>,
    profiles: Option<Vec<WorkerProfile>>,
    ledger: Option<Arc<dyn LedgerStore>>,
}

impl OrchestratorBuilder {
    /// Builder with the configured executor, checks and ledger.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            executor: None,
            checks: Vec::new(),
            profiles: None,
            ledger: None,
        }
    }

    /// Use `executor` instead of the configured worker command.
    pub fn executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Add an independent check on top of the configured ones.
    pub fn check(mut self, check: Arc<dyn IndependentCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Replace the built-in worker profiles.
    pub fn profiles(mut self, profiles: Vec<WorkerProfile>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Use `ledger` instead of `<state_dir>/ledger`.
    pub fn ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Open (or create) the state directory and wire every component.
    pub async fn build(self) -> ConductorResult<Orchestrator> {
        let config = self.config;
        config.validate()?;
        let state_dir = config.state_dir.clone();
        tokio::fs::create_dir_all(&state_dir).await?;

        let store: Arc<dyn GraphStore> = Arc::new(FileGraphStore::open(&state_dir).await?);
        let signals = Arc::new(FileSignalChannel::open(state_dir.join("complete")).await?);
        let ledger: Arc<dyn LedgerStore> = match self.ledger {
            Some(ledger) => ledger,
            None => Arc::new(FileLedger::new(state_dir.join("ledger")).await?),
        };
        let audit = Arc::new(AuditLog::new(state_dir.join("audit")));
        let monitor = Arc::new(WorkerMonitor::new());
        let gate = ConcurrencyGate::new(config.max_concurrency)?;

        let mut verifier = VerificationPipeline::new(config.verification.max_skip_rate)
            .with_audit(audit.clone());
        for check in &config.verification.checks {
            verifier = verifier.with_check(Arc::new(CommandCheck::from_config(check)));
        }
        for check in self.checks {
            verifier = verifier.with_check(check);
        }

        let executor: Option<Arc<dyn AgentExecutor>> = match self.executor {
            Some(executor) => Some(executor),
            None if config.executor.command.is_empty() => None,
            None => Some(Arc::new(CommandExecutor::from_config(&config.executor)?)),
        };
        let profiles = profile_map(self.profiles.unwrap_or_else(default_profiles));
        let dispatcher = executor.map(|executor| {
            Arc::new(
                Dispatcher::new(
                    store.clone(),
                    executor,
                    signals.clone(),
                    profiles,
                    BudgetTable::from_config(&config.budgets),
                    state_dir.join("work"),
                )
                .with_monitor(monitor.clone()),
            )
        });

        let spawner = TaskSpawner::new(store.clone())
            .with_max_depth(config.spawner.max_depth)
            .with_max_children(config.spawner.max_children);
        let runs = RunStore::new(&state_dir);
        let run = runs.load().await?;

        info!(
            state_dir = %state_dir.display(),
            max_concurrency = config.max_concurrency,
            run_id = run.as_ref().map(|r| r.run_id.as_str()).unwrap_or("-"),
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            config,
            store,
            signals,
            ledger,
            audit,
            monitor,
            gate,
            verifier,
            dispatcher,
            spawner,
            runs,
            run: Mutex::new(run),
        })
    }
}

/// One failed or blocked task at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailureSummary {
    /// Task id.
    pub id: TaskId,
    /// Worker category of the task.
    pub category: TaskCategory,
    /// `failed` or `blocked`.
    pub status: TaskStatus,
    /// Failure detail or block reason.
    pub reason: String,
}

/// Outcome of a `run_loops` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Run the report belongs to.
    pub run_id: String,
    /// Run status after the call.
    pub status: RunStatus,
    /// Loops executed so far in this run.
    pub loops: usize,
    /// Active tasks completed.
    pub completed: usize,
    /// Active tasks failed.
    pub failed: usize,
    /// Active tasks blocked.
    pub blocked: usize,
    /// Active tasks still pending.
    pub pending: usize,
    /// Every failed or blocked active task.
    pub failures: Vec<TaskFailureSummary>,
}

impl RunReport {
    /// Whether no task ended failed or blocked.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line outcome for logs and the CLI exit message.
    pub fn summary_line(&self) -> String {
        if self.failures.is_empty() {
            format!(
                "{}: {} tasks completed, {} pending",
                self.run_id, self.completed, self.pending
            )
        } else {
            format!("{} tasks failed/blocked", self.failures.len())
        }
    }
}

/// Operator view of the current state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Current run, if one was started.
    pub run: Option<RunState>,
    /// Active tasks per status.
    pub counts: StatusCounts,
    /// Longest chain of unresolved tasks, upstream first.
    pub critical_path: Vec<TaskId>,
    /// Tasks that could be dispatched now.
    pub eligible: Vec<TaskId>,
    /// Task queue rendered as markdown.
    #[serde(skip)]
    pub queue_markdown: String,
}

/// The loop driver.
///
/// Each loop re-scans the graph at its boundary, adds staged proposals, then
/// dispatches eligible tasks (bounded by the loop cap and the concurrency
/// gate) and settles every collected attempt through verification before the
/// loop ends.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn GraphStore>,
    signals: Arc<FileSignalChannel>,
    ledger: Arc<dyn LedgerStore>,
    audit: Arc<AuditLog>,
    monitor: Arc<WorkerMonitor>,
    gate: ConcurrencyGate,
    verifier: VerificationPipeline,
    dispatcher: Option<Arc<Dispatcher>>,
    spawner: TaskSpawner,
    runs: RunStore,
    run: Mutex<Option<RunState>>,
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Loaded configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// State directory.
    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }

    /// Graph store.
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Completion signal channel.
    pub fn signals(&self) -> &Arc<FileSignalChannel> {
        &self.signals
    }

    /// Run ledger.
    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Per-category worker metrics.
    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    /// Concurrency gate.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn work_dir(&self, task: &TaskId, attempt: AttemptId) -> PathBuf {
        self.config
            .state_dir
            .join("work")
            .join(task.as_str())
            .join(attempt.to_string())
    }

    /// Decompose `spec` into the graph and open a new run.
    pub async fn start_run(&self, spec: &SpecDocument) -> ConductorResult<RunState> {
        let tasks = spec.decompose()?;
        let added = self.store.add_tasks(tasks).await?;
        let state = RunState::new(spec.name.clone());
        self.runs.save(&state).await?;
        self.runs.clear_abort().await?;
        info!(run_id = %state.run_id, spec = %spec.name, tasks = added.len(), "Run started");
        self.audit.log_action(
            &state.run_id,
            None,
            "start_run",
            serde_json::json!({ "spec": spec.name, "tasks": added.len() }),
            AuditOutcome::Success,
        );
        *self.run.lock().await = Some(state.clone());
        Ok(state)
    }

    /// Settle tasks left `in_progress` by a previous coordinator: collect the
    /// completion record if the worker wrote one, otherwise fail the attempt
    /// as orphaned.
    pub async fn resume(&self) -> ConductorResult<usize> {
        let mut guard = self.run.lock().await;
        let run = guard
            .as_mut()
            .ok_or_else(|| ConductorError::Config("no run has been started".into()))?;
        let ctx = RunContext {
            run_id: run.run_id.clone(),
            loop_number: run.loops.last().map(|l| l.number).unwrap_or(0),
        };

        let graph = self.store.snapshot().await?;
        let orphans: Vec<Task> = graph
            .active_with_status(TaskStatus::InProgress)
            .into_iter()
            .cloned()
            .collect();
        let mut tally = LoopRecord::new(ctx.loop_number, 0);

        for task in &orphans {
            let Some(attempt) = task.attempt else {
                self.store
                    .apply(
                        &task.id,
                        StatusUpdate::new(TaskStatus::Failed, "worker_orphaned")
                            .expecting(TaskStatus::InProgress)
                            .failed_with(TaskFailure::new(
                                FailureKind::WorkerOrphaned,
                                "no attempt recorded",
                            )),
                    )
                    .await?;
                self.block_dependents(&task.id).await?;
                continue;
            };
            let collection = match self.signals.collect(&task.id, attempt).await {
                Ok(Some(record)) => Collection::Signaled {
                    task: task.clone(),
                    attempt,
                    record,
                    output_dir: self.work_dir(&task.id, attempt),
                    elapsed: Duration::ZERO,
                },
                other => {
                    let detail = match other {
                        Err(e) => e.to_string(),
                        _ => "coordinator restarted and no completion record exists".to_string(),
                    };
                    warn!(task_id = %task.id, attempt = %attempt, %detail, "Worker orphaned");
                    fail_attempt(
                        self.store.as_ref(),
                        &task.id,
                        attempt,
                        FailureKind::WorkerOrphaned,
                        &detail,
                    )
                    .await?;
                    Collection::Abandoned {
                        task: task.clone(),
                        attempt,
                        error: detail,
                    }
                }
            };
            self.settle(collection, &ctx, &mut tally, run).await?;
        }

        if let Some(last) = run.loops.last_mut() {
            last.completed += tally.completed;
            last.failed += tally.failed;
            last.blocked += tally.blocked;
        }
        self.runs.save(run).await?;
        if !orphans.is_empty() {
            info!(run_id = %run.run_id, settled = orphans.len(), "Resumed in-flight tasks");
        }
        Ok(orphans.len())
    }

    /// Request a whole-run stop. In-flight workers are still collected.
    pub async fn abort(&self) -> ConductorResult<()> {
        self.runs.request_abort().await?;
        warn!("Abort requested");
        Ok(())
    }

    /// Withdraw an abort request so loops can run again.
    pub async fn clear_abort(&self) -> ConductorResult<()> {
        self.runs.clear_abort().await
    }

    /// Run up to `n` loops (never more than `max_loops`). Stops early when a
    /// loop has nothing to dispatch or an abort is requested.
    pub async fn run_loops(&self, n: u32) -> ConductorResult<RunReport> {
        let n = n.min(self.config.max_loops);
        for _ in 0..n {
            if self.runs.abort_requested().await {
                self.finish_run(RunStatus::Aborted).await?;
                break;
            }
            let record = self.run_loop().await?;
            if self.runs.abort_requested().await {
                self.finish_run(RunStatus::Aborted).await?;
                break;
            }
            if record.dispatched == 0 {
                self.finish_run(RunStatus::Completed).await?;
                break;
            }
        }
        self.report().await
    }

    async fn finish_run(&self, status: RunStatus) -> ConductorResult<()> {
        let mut guard = self.run.lock().await;
        if let Some(run) = guard.as_mut() {
            run.finish(status);
            self.runs.save(run).await?;
            info!(run_id = %run.run_id, status = %status, loops = run.loops.len(), "Run finished");
        }
        Ok(())
    }

    /// Run one loop to quiescence: every attempt dispatched in it has been
    /// settled when this returns.
    pub async fn run_loop(&self) -> ConductorResult<LoopRecord> {
        let dispatcher = self.dispatcher.clone().ok_or_else(|| {
            ConductorError::Config("no worker executor configured (set executor.command)".into())
        })?;
        let mut guard = self.run.lock().await;
        let run = guard
            .as_mut()
            .ok_or_else(|| ConductorError::Config("no run has been started".into()))?;
        if run.status != RunStatus::Running {
            run.status = RunStatus::Running;
            run.finished_at = None;
        }

        let ctx = RunContext {
            run_id: run.run_id.clone(),
            loop_number: run.next_loop(),
        };
        let mut record = LoopRecord::new(ctx.loop_number, self.config.loop_task_cap);
        info!(run_id = %ctx.run_id, loop_number = ctx.loop_number, "Loop started");

        self.rescan().await?;
        self.intake(run).await?;
        self.block_stranded().await?;
        self.runs.save(run).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ConductorResult<Collection>>();
        let mut in_flight = 0usize;
        let mut aborted = false;

        loop {
            while !aborted && record.dispatched < record.cap {
                if self.runs.abort_requested().await {
                    warn!(loop_number = ctx.loop_number, "Abort requested; dispatch stopped");
                    aborted = true;
                    break;
                }
                let Some(next) = self.store.eligible().await?.into_iter().next() else {
                    break;
                };
                let slot = self.gate.acquire().await?;
                match dispatcher.dispatch(&next.id, &ctx, slot).await? {
                    DispatchOutcome::Launched(ticket) => {
                        record.dispatched += 1;
                        in_flight += 1;
                        self.audit.log_action(
                            &ctx.run_id,
                            Some(ticket.task.id.to_string()),
                            "dispatch",
                            serde_json::json!({
                                "attempt": ticket.attempt,
                                "loop": ctx.loop_number,
                                "category": ticket.task.category,
                            }),
                            AuditOutcome::Success,
                        );
                        let dispatcher = dispatcher.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(dispatcher.await_completion(ticket).await);
                        });
                    }
                    DispatchOutcome::AlreadyClaimed => {}
                    DispatchOutcome::LaunchFailed { task, error } => {
                        record.dispatched += 1;
                        record.failed += 1;
                        self.audit.log_action(
                            &ctx.run_id,
                            Some(task.id.to_string()),
                            "dispatch",
                            serde_json::json!({ "error": error }),
                            AuditOutcome::Error,
                        );
                        self.record_ledger(&ctx, &task, VerdictKind::Fail, &error, Cost::default())
                            .await?;
                        self.monitor
                            .record_verdict(task.category, VerdictKind::Fail, Cost::default())
                            .await;
                        self.block_dependents(&task.id).await?;
                    }
                }
            }

            if in_flight == 0 {
                break;
            }
            let Some(collected) = rx.recv().await else {
                break;
            };
            in_flight -= 1;
            self.settle(collected?, &ctx, &mut record, run).await?;
            self.runs.save(run).await?;
        }

        record.finished_at = Some(chrono::Utc::now());
        info!(
            run_id = %ctx.run_id,
            loop_number = ctx.loop_number,
            dispatched = record.dispatched,
            completed = record.completed,
            failed = record.failed,
            blocked = record.blocked,
            "Loop finished"
        );
        run.loops.push(record.clone());
        self.runs.save(run).await?;
        Ok(record)
    }

    /// Loop-boundary re-scan: lift environment blocks, create remediation
    /// tasks, then unblock dependents whose blockers have recovered.
    async fn rescan(&self) -> ConductorResult<()> {
        let limits = self.config.remediation;
        let graph = self.store.snapshot().await?;

        for task in graph.active_with_status(TaskStatus::Blocked) {
            let Some(BlockReason::Environment { detail }) = &task.block_reason else {
                continue;
            };
            if task.environment_rescans >= limits.max_environment_rescans {
                debug!(task_id = %task.id, %detail, "Environment rescans exhausted");
                continue;
            }
            self.store
                .compare_and_set(
                    &task.id,
                    TaskStatus::Blocked,
                    TaskStatus::Pending,
                    "environment re-scan",
                )
                .await?;
            info!(
                task_id = %task.id,
                rescan = task.environment_rescans + 1,
                "Environment block lifted"
            );
        }

        let mut remediations = Vec::new();
        for task in graph.active_with_status(TaskStatus::Failed) {
            let (root, attempts) = graph.remediation_chain(&task.id);
            if attempts > limits.max_attempts {
                continue;
            }
            remediations.push(task.remediation(&root, attempts));
        }
        for retry in remediations {
            let id = retry.id.clone();
            let supersedes = retry.supersedes.clone();
            match self.store.add_tasks(vec![retry]).await {
                Ok(_) => info!(
                    task_id = %id,
                    supersedes = supersedes.as_ref().map(TaskId::as_str).unwrap_or("-"),
                    "Remediation task created"
                ),
                Err(e) if e.is_integrity() => return Err(e),
                Err(e) => warn!(task_id = %id, error = %e, "Remediation task rejected"),
            }
        }

        // Fixpoint: unblocking one task can clear the blocker of another.
        loop {
            let graph = self.store.snapshot().await?;
            let mut changed = false;
            for task in graph.active_with_status(TaskStatus::Blocked) {
                if !matches!(task.block_reason, Some(BlockReason::Dependency { .. })) {
                    continue;
                }
                let stuck = graph
                    .dependency_states(&task.id)
                    .iter()
                    .any(|(_, status)| matches!(status, TaskStatus::Failed | TaskStatus::Blocked));
                if stuck {
                    continue;
                }
                self.store
                    .compare_and_set(
                        &task.id,
                        TaskStatus::Blocked,
                        TaskStatus::Pending,
                        "dependency recovered",
                    )
                    .await?;
                debug!(task_id = %task.id, "Dependency block lifted");
                changed = true;
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }

    /// Add proposals staged by passing research/decompose workers.
    async fn intake(&self, run: &mut RunState) -> ConductorResult<()> {
        for request in std::mem::take(&mut run.staged) {
            let parent = request.parent.clone();
            let count = request.proposals.len();
            match self.spawner.spawn(request).await {
                Ok(added) => {
                    self.audit.log_action(
                        &run.run_id,
                        Some(parent.to_string()),
                        "spawn",
                        serde_json::json!({ "added": added }),
                        AuditOutcome::Success,
                    );
                }
                Err(e) if e.is_integrity() => return Err(e),
                Err(e) => {
                    warn!(parent = %parent, proposals = count, error = %e, "Proposals rejected");
                    self.audit.log_action(
                        &run.run_id,
                        Some(parent.to_string()),
                        "spawn",
                        serde_json::json!({ "error": e.to_string(), "proposals": count }),
                        AuditOutcome::Denied,
                    );
                }
            }
        }
        Ok(())
    }

    /// Turn one collection into a committed status, a ledger line and
    /// propagated blocks.
    async fn settle(
        &self,
        collection: Collection,
        ctx: &RunContext,
        record: &mut LoopRecord,
        run: &mut RunState,
    ) -> ConductorResult<()> {
        match collection {
            Collection::Signaled {
                task,
                attempt,
                record: completion,
                output_dir,
                elapsed,
            } => {
                let current = self
                    .current_attempt(&task.id, attempt, TaskStatus::InProgress)
                    .await?;
                let Some(current) = current else {
                    debug!(
                        task_id = %task.id,
                        attempt = %attempt,
                        "Ignoring completion for a settled attempt"
                    );
                    return Ok(());
                };
                self.adjudicate(current, completion, output_dir, elapsed, ctx, record, run)
                    .await
            }
            Collection::TimedOut {
                task,
                attempt,
                timeout,
            } => {
                if self.current_attempt(&task.id, attempt, TaskStatus::Failed).await?.is_none() {
                    return Ok(());
                }
                record.failed += 1;
                self.monitor.record_timeout(task.category).await;
                let reason = ConductorError::DispatchTimeout {
                    task: task.id.clone(),
                    timeout,
                }
                .to_string();
                let cost = Cost::new(0, timeout.as_millis() as u64);
                self.record_ledger(ctx, &task, VerdictKind::Fail, &reason, cost)
                    .await?;
                self.block_dependents(&task.id).await
            }
            Collection::Abandoned {
                task,
                attempt,
                error,
            } => {
                if self.current_attempt(&task.id, attempt, TaskStatus::Failed).await?.is_none() {
                    return Ok(());
                }
                record.failed += 1;
                self.monitor
                    .record_verdict(task.category, VerdictKind::Fail, Cost::default())
                    .await;
                self.record_ledger(ctx, &task, VerdictKind::Fail, &error, Cost::default())
                    .await?;
                self.block_dependents(&task.id).await
            }
        }
    }

    /// The task, if `attempt` is still its current attempt and it is in `status`.
    async fn current_attempt(
        &self,
        id: &TaskId,
        attempt: AttemptId,
        status: TaskStatus,
    ) -> ConductorResult<Option<Task>> {
        let task = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ConductorError::UnknownTask(id.clone()))?;
        Ok((task.status == status && task.attempt == Some(attempt)).then_some(task))
    }

    #[allow(clippy::too_many_arguments)]
    async fn adjudicate(
        &self,
        task: Task,
        completion: CompletionRecord,
        output_dir: PathBuf,
        elapsed: Duration,
        ctx: &RunContext,
        record: &mut LoopRecord,
        run: &mut RunState,
    ) -> ConductorResult<()> {
        let attempt = completion.attempt;
        let verdict = self
            .verifier
            .verify(&ctx.run_id, &completion, &task, &output_dir)
            .await;
        if let Err(e) = self.signals.record_verdict(&completion, &verdict).await {
            warn!(task_id = %task.id, error = %e, "Failed to attach verdict to completion record");
        }

        let update = match verdict.kind {
            VerdictKind::Pass => StatusUpdate::new(TaskStatus::Completed, "verified"),
            VerdictKind::Fail => {
                let kind = if verdict.tampered {
                    FailureKind::EvidenceTampered
                } else {
                    FailureKind::VerificationFailed
                };
                StatusUpdate::new(TaskStatus::Failed, kind.to_string())
                    .failed_with(TaskFailure::new(kind, verdict.reason.clone()))
            }
            VerdictKind::Blocked => StatusUpdate::new(TaskStatus::Blocked, "environment not ready")
                .blocked_by(BlockReason::Environment {
                    detail: verdict.reason.clone(),
                }),
        }
        .expecting(TaskStatus::InProgress)
        .for_attempt(attempt);

        match self.store.apply(&task.id, update).await {
            Ok(_) => {}
            Err(ConductorError::StatusConflict { actual, .. }) => {
                warn!(
                    task_id = %task.id,
                    attempt = %attempt,
                    status = %actual,
                    "Verdict lost to a concurrent settle"
                );
                return Ok(());
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to commit verdict");
                return Err(e);
            }
        }

        let reported = completion.report.cost;
        let cost = if reported.duration_ms == 0 {
            Cost::new(reported.tokens, elapsed.as_millis() as u64)
        } else {
            reported
        };
        self.record_ledger(ctx, &task, verdict.kind, &verdict.reason, cost)
            .await?;
        self.monitor.record_verdict(task.category, verdict.kind, cost).await;

        match verdict.kind {
            VerdictKind::Pass => {
                record.completed += 1;
                let proposals = completion.report.proposed_tasks;
                if !proposals.is_empty() {
                    if task.category.proposes_tasks() {
                        info!(
                            task_id = %task.id,
                            proposals = proposals.len(),
                            "Proposals staged for next loop"
                        );
                        run.staged.push(SpawnRequest {
                            parent: task.id.clone(),
                            proposals,
                        });
                    } else {
                        warn!(
                            task_id = %task.id,
                            category = %task.category,
                            "Ignoring proposals from a non-proposing category"
                        );
                    }
                }
                Ok(())
            }
            VerdictKind::Fail => {
                record.failed += 1;
                self.block_dependents(&task.id).await
            }
            VerdictKind::Blocked => {
                record.blocked += 1;
                self.block_dependents(&task.id).await
            }
        }
    }

    /// Append the ledger line for one adjudication. The verdict is already
    /// committed, so a write failure stops the run instead of leaving the
    /// ledger short.
    async fn record_ledger(
        &self,
        ctx: &RunContext,
        task: &Task,
        verdict: VerdictKind,
        reason: &str,
        cost: Cost,
    ) -> ConductorResult<()> {
        let entry = LedgerEntry::new(
            ctx.run_id.clone(),
            ctx.loop_number,
            task.id.clone(),
            task.category,
            task.complexity,
            verdict,
        )
        .with_reason(reason)
        .with_cost(cost);
        self.ledger.append(entry).await.map_err(|e| {
            error!(task_id = %task.id, error = %e, "Failed to append ledger entry");
            e
        })
    }

    /// Block pending tasks whose effective dependency is failed with no
    /// retry left, or blocked. Runs after remediation and intake, so tasks
    /// added behind a dead dependency are reported instead of waiting forever.
    async fn block_stranded(&self) -> ConductorResult<()> {
        let graph = self.store.snapshot().await?;
        for task in graph.active_with_status(TaskStatus::Pending) {
            let Some((blocker, _)) = graph
                .dependency_states(&task.id)
                .into_iter()
                .find(|(_, status)| matches!(status, TaskStatus::Failed | TaskStatus::Blocked))
            else {
                continue;
            };
            let update = StatusUpdate::new(
                TaskStatus::Blocked,
                format!("dependency {blocker} did not pass"),
            )
            .expecting(TaskStatus::Pending)
            .blocked_by(BlockReason::Dependency {
                task: blocker.clone(),
            });
            match self.store.apply(&task.id, update).await {
                Ok(_) => {
                    info!(task_id = %task.id, blocker = %blocker, "Stranded task blocked");
                    self.block_dependents(&task.id).await?;
                }
                Err(ConductorError::StatusConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Block every pending task that transitively depends on `id`.
    async fn block_dependents(&self, id: &TaskId) -> ConductorResult<()> {
        let mut frontier = vec![id.clone()];
        while let Some(blocker) = frontier.pop() {
            let graph = self.store.snapshot().await?;
            for dependent in graph.dependents(&blocker) {
                if dependent.status != TaskStatus::Pending {
                    continue;
                }
                let reason = format!("dependency {blocker} did not pass");
                let update = StatusUpdate::new(TaskStatus::Blocked, reason)
                    .expecting(TaskStatus::Pending)
                    .blocked_by(BlockReason::Dependency {
                        task: blocker.clone(),
                    });
                match self.store.apply(&dependent.id, update).await {
                    Ok(_) => {
                        info!(
                            task_id = %dependent.id,
                            blocker = %blocker,
                            "Task blocked by dependency"
                        );
                        frontier.push(dependent.id.clone());
                    }
                    Err(ConductorError::StatusConflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Counts and failures of the current run.
    pub async fn report(&self) -> ConductorResult<RunReport> {
        let run = self.run.lock().await.clone();
        let graph = self.store.snapshot().await?;
        let counts = graph.counts();

        let mut failures = Vec::new();
        for status in [TaskStatus::Failed, TaskStatus::Blocked] {
            for task in graph.active_with_status(status) {
                let reason = match (&task.failure, &task.block_reason) {
                    (Some(failure), _) if status == TaskStatus::Failed => {
                        format!("{}: {}", failure.kind, failure.detail)
                    }
                    (_, Some(block)) => block.to_string(),
                    _ => status.to_string(),
                };
                failures.push(TaskFailureSummary {
                    id: task.id.clone(),
                    category: task.category,
                    status,
                    reason,
                });
            }
        }

        Ok(RunReport {
            run_id: run.as_ref().map(|r| r.run_id.clone()).unwrap_or_default(),
            status: run.as_ref().map(|r| r.status).unwrap_or(RunStatus::Running),
            loops: run.as_ref().map(|r| r.loops.len()).unwrap_or(0),
            completed: counts.completed,
            failed: counts.failed,
            blocked: counts.blocked,
            pending: counts.pending,
            failures,
        })
    }

    /// Snapshot for `conductor status`.
    pub async fn status(&self) -> ConductorResult<StatusReport> {
        let graph = self.store.snapshot().await?;
        Ok(StatusReport {
            run: self.runs.load().await?,
            counts: graph.counts(),
            critical_path: graph.critical_path(),
            eligible: graph.eligible().into_iter().map(|t| t.id.clone()).collect(),
            queue_markdown: render_task_queue(&graph),
        })
    }
}
