//! Loop driver for the Conductor orchestrator.
//!
//! Dispatches eligible tasks to isolated workers under a fixed concurrency
//! limit, waits for their completion signals with bounded timeouts, and
//! verifies every claimed result independently before it is committed to the
//! task graph.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Runs loops: boundary re-scan, proposal intake, dispatch and settlement.
//! - [`ConcurrencyGate`] — Bounds simultaneously running workers.
//! - [`Dispatcher`] — Claims a task and launches exactly one worker for it.
//! - [`FileSignalChannel`] — Exactly-once completion records with watcher wake-ups.
//! - [`VerificationPipeline`] — Adjudicates PASS / FAIL / BLOCKED from evidence.
//! - [`WorkerMonitor`] — Live workers and per-category metrics.
//! - [`TaskSpawner`] — Adds worker-proposed tasks under depth and fan-out limits.

/// `conductor.toml` configuration.
pub mod config;
/// Task claiming, worker launch and completion waits.
pub mod dispatcher;
/// The loop driver.
pub mod engine;
/// Worker executors.
pub mod executor;
/// Concurrency limit.
pub mod gate;
/// Worker monitoring.
pub mod monitor;
/// Worker profiles and execution budgets.
pub mod profiles;
/// Completion reports and verdicts.
pub mod report;
/// Run state and the abort marker.
pub mod run;
/// Completion signal channel.
pub mod signal;
/// Proposed-task intake.
pub mod spawner;
/// Independent verification.
pub mod verify;

pub use config::{
    BudgetConfig, BudgetSpec, CheckConfig, ExecutorConfig, OrchestratorConfig, RemediationConfig,
    SpawnerConfig, VerificationConfig,
};
pub use dispatcher::{
    Collection, DispatchOutcome, DispatchTicket, Dispatcher, RunContext, WaitPhase,
};
pub use engine::{Orchestrator, OrchestratorBuilder, RunReport, StatusReport, TaskFailureSummary};
pub use executor::{AgentExecutor, CommandExecutor, ExecutionContext, WorkerContext};
pub use gate::{ConcurrencyGate, SlotHandle};
pub use monitor::{CategoryState, WorkerMetrics, WorkerMonitor};
pub use profiles::{default_profiles, BudgetTable, ExecutionBudget, WorkerProfile};
pub use report::{
    CheckReport, CheckStatus, ClaimedOutcome, CompletionRecord, ErrorKind, EvidenceArtifact,
    SkipReason, TaskProposal, Verdict, WorkerReport,
};
pub use run::{LoopRecord, RunState, RunStatus, RunStore};
pub use signal::{FileSignalChannel, WaitOutcome};
pub use spawner::{SpawnRequest, TaskSpawner};
pub use verify::{CommandCheck, IndependentCheck, VerificationPipeline, ENVIRONMENT_EXIT_CODE};
