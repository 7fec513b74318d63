use crate::config::ExecutorConfig;
use crate::profiles::{ExecutionBudget, WorkerProfile};
use crate::report::{CompletionRecord, WorkerReport};
use crate::signal::FileSignalChannel;
use async_trait::async_trait;
use conductor_core::persist::write_json;
use conductor_core::{AttemptId, ConductorError, ConductorResult};
use conductor_graph::Task;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a worker needs for one attempt.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Run the attempt belongs to.
    pub run_id: String,
    /// Loop that dispatched it.
    pub loop_number: u32,
    /// Attempt id to echo back in the completion record.
    pub attempt: AttemptId,
    /// Task to work on.
    pub task: Task,
    /// Writable directory for this attempt's artifacts.
    pub output_dir: PathBuf,
    /// Where the completion record must be written.
    pub signal_path: PathBuf,
    /// Prompt and tool set for the task's category.
    pub profile: WorkerProfile,
    /// Limits for the task's complexity tier.
    pub budget: ExecutionBudget,
    signals: Arc<FileSignalChannel>,
}

/// Serializable view of an [`ExecutionContext`], written as `context.json`.
#[derive(Debug, Serialize)]
pub struct WorkerContext<'a> {
    /// See [`ExecutionContext::run_id`].
    pub run_id: &'a str,
    /// See [`ExecutionContext::loop_number`].
    pub loop_number: u32,
    /// See [`ExecutionContext::attempt`].
    pub attempt: AttemptId,
    /// See [`ExecutionContext::task`].
    pub task: &'a Task,
    /// See [`ExecutionContext::output_dir`].
    pub output_dir: &'a PathBuf,
    /// See [`ExecutionContext::signal_path`].
    pub signal_path: &'a PathBuf,
    /// See [`ExecutionContext::profile`].
    pub profile: &'a WorkerProfile,
    /// See [`ExecutionContext::budget`].
    pub budget: &'a ExecutionBudget,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        loop_number: u32,
        attempt: AttemptId,
        task: Task,
        output_dir: PathBuf,
        profile: WorkerProfile,
        budget: ExecutionBudget,
        signals: Arc<FileSignalChannel>,
    ) -> Self {
        let signal_path = signals.location(&task.id, attempt);
        Self {
            run_id,
            loop_number,
            attempt,
            task,
            output_dir,
            signal_path,
            profile,
            budget,
            signals,
        }
    }

    /// Borrowed view for serialization.
    pub fn worker_context(&self) -> WorkerContext<'_> {
        WorkerContext {
            run_id: &self.run_id,
            loop_number: self.loop_number,
            attempt: self.attempt,
            task: &self.task,
            output_dir: &self.output_dir,
            signal_path: &self.signal_path,
            profile: &self.profile,
            budget: &self.budget,
        }
    }

    /// Signal completion of this attempt. For in-process workers.
    pub async fn complete(&self, report: WorkerReport) -> ConductorResult<()> {
        let record = CompletionRecord::new(self.task.id.clone(), self.attempt, report);
        self.signals.signal(&record).await
    }
}

/// Starts workers.
///
/// `launch` must return as soon as the worker is running. The worker reports
/// back only through the completion signal channel.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Start a worker for `ctx` and return once it is running.
    async fn launch(&self, ctx: ExecutionContext) -> ConductorResult<()>;
}

/// Runs each worker as an external process.
///
/// The process starts in the attempt's output directory with the context in
/// `CONDUCTOR_*` environment variables and in `context.json`. Its output goes
/// to `worker.log`. It must write its completion record to
/// `CONDUCTOR_SIGNAL_PATH` (for example with `conductor signal`).
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandExecutor {
    /// Executor for `command`, program first. Fails when it is empty.
    pub fn new(command: Vec<String>) -> ConductorResult<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConductorError::Config("executor.command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            env: BTreeMap::new(),
        })
    }

    /// Executor from the `[executor]` config section.
    pub fn from_config(config: &ExecutorConfig) -> ConductorResult<Self> {
        Ok(Self::new(config.command.clone())?.with_env(config.env.clone()))
    }

    /// Add environment variables for every worker.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn launch(&self, ctx: ExecutionContext) -> ConductorResult<()> {
        let context_path = ctx.output_dir.join("context.json");
        write_json(&context_path, &ctx.worker_context()).await?;

        let log = tokio::fs::File::create(ctx.output_dir.join("worker.log"))
            .await?
            .into_std()
            .await;
        let stderr = log.try_clone()?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&ctx.output_dir)
            .envs(&self.env)
            .env("CONDUCTOR_RUN_ID", &ctx.run_id)
            .env("CONDUCTOR_LOOP", ctx.loop_number.to_string())
            .env("CONDUCTOR_TASK_ID", ctx.task.id.as_str())
            .env("CONDUCTOR_ATTEMPT", ctx.attempt.to_string())
            .env("CONDUCTOR_CATEGORY", ctx.task.category.to_string())
            .env("CONDUCTOR_COMPLEXITY", ctx.task.complexity.to_string())
            .env("CONDUCTOR_OUTPUT_DIR", &ctx.output_dir)
            .env("CONDUCTOR_SIGNAL_PATH", &ctx.signal_path)
            .env("CONDUCTOR_CONTEXT", &context_path)
            .env("CONDUCTOR_TIMEOUT_MS", ctx.budget.timeout.as_millis().to_string())
            .env("CONDUCTOR_MAX_TURNS", ctx.budget.max_turns.to_string())
            .env("CONDUCTOR_TOKEN_BUDGET", ctx.budget.token_budget.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));

        let mut child = cmd.spawn().map_err(|e| {
            ConductorError::Executor(format!("Failed to launch '{}': {e}", self.program))
        })?;
        info!(
            task_id = %ctx.task.id,
            attempt = %ctx.attempt,
            pid = child.id().unwrap_or_default(),
            "Worker process launched"
        );

        // Reap the child; its outcome is judged from the completion record only.
        let task_id = ctx.task.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!(task_id = %task_id, "Worker process exited");
                }
                Ok(status) => {
                    warn!(
                        task_id = %task_id,
                        code = status.code().unwrap_or(-1),
                        "Worker process exited with failure"
                    );
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to wait for worker process");
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::profiles::{default_profiles, BudgetTable};
    use conductor_core::{Complexity, TaskCategory};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn context(tmp: &TempDir) -> ExecutionContext {
        let signals = Arc::new(FileSignalChannel::open(tmp.path().join("complete")).await.unwrap());
        let output_dir = tmp.path().join("work");
        tokio::fs::create_dir_all(&output_dir).await.unwrap();
        ExecutionContext::new(
            "run-test".into(),
            1,
            uuid::Uuid::new_v4(),
            Task::new("BUILD-001", TaskCategory::Build, "build it"),
            output_dir,
            default_profiles().remove(0),
            BudgetTable::default().for_complexity(Complexity::Normal),
            signals,
        )
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            CommandExecutor::new(vec![]),
            Err(ConductorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_executor_error() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        let executor = CommandExecutor::new(vec!["/nonexistent/conductor-worker".into()]).unwrap();
        let err = executor.launch(ctx.clone()).await.unwrap_err();
        assert!(matches!(err, ConductorError::Executor(_)));
        assert!(ctx.output_dir.join("context.json").exists());
    }

    #[tokio::test]
    async fn test_process_sees_context_env() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        let executor = CommandExecutor::new(vec![
            "sh".into(),
            "-c".into(),
            "printf '%s' \"$CONDUCTOR_TASK_ID\" > seen.tmp && mv seen.tmp seen.txt".into(),
        ])
        .unwrap();
        executor.launch(ctx.clone()).await.unwrap();

        let seen = ctx.output_dir.join("seen.txt");
        for _ in 0..100 {
            if seen.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(tokio::fs::read_to_string(&seen).await.unwrap(), "BUILD-001");
    }

    #[tokio::test]
    async fn test_in_process_completion() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        ctx.complete(WorkerReport::success("done")).await.unwrap();
        assert!(ctx.signal_path.exists());
        assert!(ctx.complete(WorkerReport::success("again")).await.is_err());
    }
}
