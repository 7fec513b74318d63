#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_core::{
    ConductorError, ConductorResult, Cost, TaskCategory, TaskId, TaskStatus, VerdictKind,
};
use conductor_graph::{BlockReason, FailureKind, SpecDocument};
use conductor_ledger::{LedgerEntry, LedgerStore};
use conductor_orchestrator::{
    AgentExecutor, BudgetConfig, CheckStatus, CompletionRecord, ErrorKind, ExecutionContext,
    Orchestrator, OrchestratorConfig, RunStatus, TaskProposal, WorkerReport,
};
use conductor_security::{fingerprint, AuditOutcome};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone)]
enum Behavior {
    /// Write an artifact and report it faithfully.
    Pass,
    /// Same, after a random delay of up to the given milliseconds.
    SlowPass(u64),
    /// Claim failure.
    Fail,
    /// Report an artifact digest that does not match the file.
    Tamper,
    /// Claim success with an environment error on a sub-check.
    EnvironmentDown,
    /// Pass and propose follow-up tasks.
    Propose(Vec<TaskProposal>),
    /// Never signal.
    Silent,
}

/// In-process worker stand-in, scripted per task id.
#[derive(Default)]
struct ScriptedExecutor {
    script: HashMap<String, Behavior>,
    launched: Mutex<Vec<ExecutionContext>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    fn with(mut self, task: &str, behavior: Behavior) -> Self {
        self.script.insert(task.to_string(), behavior);
        self
    }

    fn launches_of(&self, task: &str) -> usize {
        self.launched
            .lock()
            .iter()
            .filter(|ctx| ctx.task.id.as_str() == task)
            .count()
    }

    fn context_of(&self, task: &str) -> ExecutionContext {
        self.launched
            .lock()
            .iter()
            .find(|ctx| ctx.task.id.as_str() == task)
            .cloned()
            .expect("task was launched")
    }
}

async fn passing_report(ctx: &ExecutionContext) -> WorkerReport {
    let content = format!("output of {}", ctx.task.id);
    tokio::fs::write(ctx.output_dir.join("result.txt"), &content)
        .await
        .unwrap();
    WorkerReport::success("implemented")
        .with_artifact("result.txt", fingerprint(content.as_bytes()))
        .with_check("unit", CheckStatus::Passed)
        .with_cost(Cost::new(100, 0))
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn launch(&self, ctx: ExecutionContext) -> ConductorResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.launched.lock().push(ctx.clone());

        let behavior = self
            .script
            .get(ctx.task.id.as_str())
            .cloned()
            .unwrap_or(Behavior::Pass);
        let active = self.active.clone();

        let report = match behavior {
            Behavior::Silent => return Ok(()),
            Behavior::SlowPass(max_ms) => {
                let delay = rand::thread_rng().gen_range(10..=max_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let report = passing_report(&ctx).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    ctx.complete(report).await.unwrap();
                });
                return Ok(());
            }
            Behavior::Pass => passing_report(&ctx).await,
            Behavior::Fail => WorkerReport::failure("could not implement"),
            Behavior::Tamper => {
                tokio::fs::write(ctx.output_dir.join("result.txt"), b"actual")
                    .await
                    .unwrap();
                WorkerReport::success("implemented")
                    .with_artifact("result.txt", fingerprint(b"claimed"))
                    .with_check("unit", CheckStatus::Passed)
            }
            Behavior::EnvironmentDown => WorkerReport::success("implemented")
                .with_check("unit", CheckStatus::Passed)
                .with_check(
                    "db",
                    CheckStatus::Error {
                        kind: ErrorKind::Environment,
                        detail: "connection refused".into(),
                    },
                ),
            Behavior::Propose(proposals) => {
                let mut report = passing_report(&ctx).await;
                report.proposed_tasks = proposals;
                report
            }
        };
        active.fetch_sub(1, Ordering::SeqCst);
        ctx.complete(report).await
    }
}

fn config(tmp: &TempDir, concurrency: usize, cap: usize, timeout: Duration) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        state_dir: tmp.path().join("state"),
        max_concurrency: concurrency,
        loop_task_cap: cap,
        ..OrchestratorConfig::default()
    };
    config.budgets = BudgetConfig::default().with_uniform_timeout(timeout);
    config.remediation.max_attempts = 0;
    config
}

async fn orchestrator(config: OrchestratorConfig, executor: Arc<ScriptedExecutor>) -> Orchestrator {
    Orchestrator::builder(config)
        .executor(executor)
        .build()
        .await
        .unwrap()
}

fn chain_spec() -> SpecDocument {
    SpecDocument::from_toml_str(
        r#"
name = "chain"

[[features]]
id = "T1"
objective = "first"

[[features]]
id = "T2"
objective = "second"
depends_on = ["T1"]
"#,
    )
    .unwrap()
}

fn independent_spec(count: usize) -> SpecDocument {
    let mut toml = String::from("name = \"wide\"\n");
    for i in 1..=count {
        toml.push_str(&format!("\n[[features]]\nid = \"T{i}\"\nobjective = \"task {i}\"\n"));
    }
    SpecDocument::from_toml_str(&toml).unwrap()
}

async fn status_of(orch: &Orchestrator, id: &str) -> conductor_graph::Task {
    orch.store().get(&TaskId::from(id)).await.unwrap().unwrap()
}

#[tokio::test]
async fn failed_dependency_blocks_dependent_without_remediation() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default().with("T1", Behavior::Fail));
    let orch = orchestrator(config(&tmp, 4, 5, Duration::from_secs(5)), executor.clone()).await;
    let run = orch.start_run(&chain_spec()).await.unwrap();

    let report = orch.run_loops(5).await.unwrap();

    let t1 = status_of(&orch, "T1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.failure.unwrap().kind, FailureKind::VerificationFailed);
    let t2 = status_of(&orch, "T2").await;
    assert_eq!(t2.status, TaskStatus::Blocked);
    assert_eq!(
        t2.block_reason,
        Some(BlockReason::Dependency { task: "T1".into() })
    );
    assert_eq!(executor.launches_of("T2"), 0);

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.failed, 1);
    assert_eq!(report.blocked, 1);
    assert_eq!(report.summary_line(), "2 tasks failed/blocked");

    let summary = orch.ledger().summarize(&run.run_id).await.unwrap();
    assert_eq!(summary.totals.total, 1);
    assert_eq!(summary.totals.failed, 1);
}

#[tokio::test]
async fn remediation_task_unblocks_dependent() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default().with("T1", Behavior::Fail));
    let mut cfg = config(&tmp, 4, 5, Duration::from_secs(5));
    cfg.remediation.max_attempts = 1;
    let orch = orchestrator(cfg, executor.clone()).await;
    orch.start_run(&chain_spec()).await.unwrap();

    let report = orch.run_loops(5).await.unwrap();

    let retry = status_of(&orch, "T1-R1").await;
    assert_eq!(retry.status, TaskStatus::Completed);
    assert_eq!(retry.supersedes, Some("T1".into()));
    assert_eq!(status_of(&orch, "T2").await.status, TaskStatus::Completed);
    assert_eq!(executor.launches_of("T1"), 1);
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_gate_capacity() {
    let tmp = TempDir::new().unwrap();
    let mut executor = ScriptedExecutor::default();
    for i in 1..=12 {
        executor = executor.with(&format!("T{i}"), Behavior::SlowPass(80));
    }
    let executor = Arc::new(executor);
    let orch = orchestrator(config(&tmp, 10, 12, Duration::from_secs(10)), executor.clone()).await;
    orch.start_run(&independent_spec(12)).await.unwrap();

    let report = orch.run_loops(1).await.unwrap();

    assert!(executor.max_active.load(Ordering::SeqCst) <= 10);
    assert!(orch.gate().high_water() <= 10);
    assert!(orch.monitor().high_water().await <= 10);
    assert_eq!(orch.gate().in_use(), 0);
    assert_eq!(report.completed, 12);
    for i in 1..=12 {
        assert_eq!(executor.launches_of(&format!("T{i}")), 1);
    }
}

#[tokio::test]
async fn silent_worker_times_out_and_frees_its_slot() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default().with("T1", Behavior::Silent));
    let orch = orchestrator(config(&tmp, 1, 5, Duration::from_millis(100)), executor.clone()).await;
    orch.start_run(&independent_spec(2)).await.unwrap();

    let report = orch.run_loops(1).await.unwrap();

    let t1 = status_of(&orch, "T1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.failure.unwrap().kind, FailureKind::DispatchTimeout);
    assert_eq!(status_of(&orch, "T2").await.status, TaskStatus::Completed);
    assert_eq!(orch.gate().available(), 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1);

    let metrics = orch.monitor().aggregate_metrics().await;
    assert_eq!(metrics.timed_out, 1);
}

#[tokio::test]
async fn late_signal_does_not_resurrect_timed_out_task() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default().with("T1", Behavior::Silent));
    let orch = orchestrator(config(&tmp, 2, 5, Duration::from_millis(100)), executor.clone()).await;
    orch.start_run(&independent_spec(1)).await.unwrap();
    orch.run_loops(1).await.unwrap();

    let ctx = executor.context_of("T1");
    let late = passing_report(&ctx).await;
    ctx.complete(late).await.unwrap();
    orch.run_loops(2).await.unwrap();

    let t1 = status_of(&orch, "T1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.failure.unwrap().kind, FailureKind::DispatchTimeout);
    assert_eq!(executor.launches_of("T1"), 1);
}

#[tokio::test]
async fn tampered_evidence_fails_and_is_audited() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default().with("T1", Behavior::Tamper));
    let orch = orchestrator(config(&tmp, 2, 5, Duration::from_secs(5)), executor).await;
    orch.start_run(&independent_spec(1)).await.unwrap();

    orch.run_loops(1).await.unwrap();

    let t1 = status_of(&orch, "T1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.failure.unwrap().kind, FailureKind::EvidenceTampered);

    orch.audit().flush().await;
    let entries = orch.audit().entries().await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.action == "evidence_tamper" && e.outcome == AuditOutcome::Tamper));

    let record: CompletionRecord = orch
        .signals()
        .collect(&"T1".into(), t1.attempt.unwrap())
        .await
        .unwrap()
        .unwrap();
    let verdict = record.verdict.unwrap();
    assert_eq!(verdict.kind, VerdictKind::Fail);
    assert!(verdict.tampered);
}

#[tokio::test]
async fn environment_block_is_retried_up_to_the_rescan_limit() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default().with("T1", Behavior::EnvironmentDown));
    let mut cfg = config(&tmp, 2, 5, Duration::from_secs(5));
    cfg.remediation.max_environment_rescans = 1;
    let orch = orchestrator(cfg, executor.clone()).await;
    orch.start_run(&chain_spec()).await.unwrap();

    let report = orch.run_loops(5).await.unwrap();

    let t1 = status_of(&orch, "T1").await;
    assert_eq!(t1.status, TaskStatus::Blocked);
    assert!(matches!(t1.block_reason, Some(BlockReason::Environment { .. })));
    assert_eq!(t1.environment_rescans, 1);
    assert_eq!(executor.launches_of("T1"), 2);
    assert_eq!(status_of(&orch, "T2").await.status, TaskStatus::Blocked);
    assert_eq!(report.blocked, 2);
}

#[tokio::test]
async fn research_proposals_join_the_next_loop() {
    let tmp = TempDir::new().unwrap();
    let proposal = TaskProposal {
        id: "BUILD-900".into(),
        title: "Follow-up".into(),
        category: TaskCategory::Build,
        objective: "close the gap".into(),
        acceptance_criteria: vec![],
        depends_on: vec![],
        complexity: Default::default(),
        priority: Default::default(),
    };
    let executor = Arc::new(
        ScriptedExecutor::default().with("RESEARCH-1", Behavior::Propose(vec![proposal])),
    );
    let orch = orchestrator(config(&tmp, 2, 5, Duration::from_secs(5)), executor.clone()).await;
    let spec = SpecDocument::from_toml_str(
        r#"
name = "research"

[[tasks]]
id = "RESEARCH-1"
category = "research"
objective = "find gaps"
"#,
    )
    .unwrap();
    orch.start_run(&spec).await.unwrap();

    let report = orch.run_loops(5).await.unwrap();

    let child = status_of(&orch, "BUILD-900").await;
    assert_eq!(child.status, TaskStatus::Completed);
    assert_eq!(child.parent, Some("RESEARCH-1".into()));
    assert_eq!(child.depth, 1);
    assert_eq!(report.completed, 2);
    assert_eq!(report.loops, 3);
}

fn proposal(id: &str, depends_on: &[&str]) -> TaskProposal {
    TaskProposal {
        id: id.into(),
        title: format!("Follow-up {id}"),
        category: TaskCategory::Build,
        objective: format!("do {id}"),
        acceptance_criteria: vec![],
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        complexity: Default::default(),
        priority: Default::default(),
    }
}

#[tokio::test]
async fn proposal_behind_a_failed_task_is_blocked_and_reported() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with("T1", Behavior::Fail)
            .with("RESEARCH-1", Behavior::Propose(vec![proposal("P1", &["T1"])])),
    );
    let orch = orchestrator(config(&tmp, 2, 5, Duration::from_secs(5)), executor.clone()).await;
    let spec = SpecDocument::from_toml_str(
        r#"
name = "mixed"

[[features]]
id = "T1"
objective = "first"

[[tasks]]
id = "RESEARCH-1"
category = "research"
objective = "find gaps"
"#,
    )
    .unwrap();
    orch.start_run(&spec).await.unwrap();

    let report = orch.run_loops(5).await.unwrap();

    let p1 = status_of(&orch, "P1").await;
    assert_eq!(p1.status, TaskStatus::Blocked);
    assert_eq!(
        p1.block_reason,
        Some(BlockReason::Dependency { task: "T1".into() })
    );
    assert_eq!(executor.launches_of("P1"), 0);
    assert!(report.failures.iter().any(|f| f.id.as_str() == "P1"));
    assert_eq!(report.summary_line(), "2 tasks failed/blocked");
}

/// Accepts nothing.
struct BrokenLedger;

#[async_trait]
impl LedgerStore for BrokenLedger {
    async fn append(&self, _entry: LedgerEntry) -> ConductorResult<()> {
        Err(ConductorError::Store("ledger volume is read-only".into()))
    }

    async fn entries(&self, _run_id: &str) -> ConductorResult<Vec<LedgerEntry>> {
        Ok(Vec::new())
    }

    async fn runs(&self) -> ConductorResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn ledger_write_failure_stops_the_run() {
    let tmp = TempDir::new().unwrap();
    let orch = Orchestrator::builder(config(&tmp, 1, 5, Duration::from_secs(5)))
        .executor(Arc::new(ScriptedExecutor::default()))
        .ledger(Arc::new(BrokenLedger))
        .build()
        .await
        .unwrap();
    orch.start_run(&independent_spec(2)).await.unwrap();

    let err = orch.run_loops(1).await.unwrap_err();
    assert!(matches!(err, ConductorError::Store(_)));
    // The verdict was committed before the ledger write.
    assert_eq!(orch.store().snapshot().await.unwrap().counts().completed, 1);
}

#[tokio::test]
async fn abort_stops_dispatch() {
    let tmp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::default());
    let orch = orchestrator(config(&tmp, 2, 5, Duration::from_secs(5)), executor.clone()).await;
    orch.start_run(&independent_spec(3)).await.unwrap();

    orch.abort().await.unwrap();
    let report = orch.run_loops(3).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.pending, 3);
    assert!(executor.launched.lock().is_empty());

    orch.clear_abort().await.unwrap();
    let report = orch.run_loops(3).await.unwrap();
    assert_eq!(report.completed, 3);
}

#[tokio::test]
async fn resume_fails_orphans_and_collects_signaled_attempts() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(&tmp, 2, 5, Duration::from_secs(5));
    let (orphan, signaled) = {
        let orch = orchestrator(cfg.clone(), Arc::new(ScriptedExecutor::default())).await;
        orch.start_run(&independent_spec(2)).await.unwrap();
        // A coordinator that claimed both tasks and then crashed.
        let orphan = orch.store().begin_attempt(&"T1".into()).await.unwrap();
        let signaled = orch.store().begin_attempt(&"T2".into()).await.unwrap();
        let work = cfg.state_dir.join("work").join("T2").join(signaled.to_string());
        tokio::fs::create_dir_all(&work).await.unwrap();
        tokio::fs::write(work.join("result.txt"), b"done").await.unwrap();
        let report = WorkerReport::success("done")
            .with_artifact("result.txt", fingerprint(b"done"))
            .with_check("unit", CheckStatus::Passed);
        orch.signals()
            .signal(&CompletionRecord::new("T2".into(), signaled, report))
            .await
            .unwrap();
        (orphan, signaled)
    };

    let orch = orchestrator(cfg, Arc::new(ScriptedExecutor::default())).await;
    assert_eq!(orch.resume().await.unwrap(), 2);

    let t1 = status_of(&orch, "T1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.attempt, Some(orphan));
    assert_eq!(t1.failure.unwrap().kind, FailureKind::WorkerOrphaned);
    let t2 = status_of(&orch, "T2").await;
    assert_eq!(t2.status, TaskStatus::Completed);
    assert_eq!(t2.attempt, Some(signaled));
}
