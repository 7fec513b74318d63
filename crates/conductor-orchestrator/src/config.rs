//! Orchestrator configuration (`conductor.toml`).
//!
//! Every field has a default, so an empty file is a valid configuration.

use conductor_core::{Complexity, ConductorError, ConductorResult, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Where the graph, run state, ledger and signals live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Maximum number of simultaneously running workers.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Maximum number of dispatches per loop.
    #[serde(default = "default_loop_task_cap")]
    pub loop_task_cap: usize,
    /// Upper bound on loops for a single `run_loops` call.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Execution budgets per complexity tier.
    #[serde(default)]
    pub budgets: BudgetConfig,
    /// Verification policy and independent checks.
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Retry limits.
    #[serde(default)]
    pub remediation: RemediationConfig,
    /// Limits on worker-proposed tasks.
    #[serde(default)]
    pub spawner: SpawnerConfig,
    /// Worker command.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_concurrency: default_max_concurrency(),
            loop_task_cap: default_loop_task_cap(),
            max_loops: default_max_loops(),
            budgets: BudgetConfig::default(),
            verification: VerificationConfig::default(),
            remediation: RemediationConfig::default(),
            spawner: SpawnerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Execution budget for one complexity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSpec {
    /// Time allowed before the attempt is timed out.
    pub timeout_ms: u64,
    /// Turn limit handed to the worker.
    pub max_turns: u32,
    /// Token limit handed to the worker.
    pub token_budget: u64,
}

/// Budgets for each complexity tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Budget for easy tasks.
    #[serde(default = "default_easy_budget")]
    pub easy: BudgetSpec,
    /// Budget for normal tasks.
    #[serde(default = "default_normal_budget")]
    pub normal: BudgetSpec,
    /// Budget for complex tasks.
    #[serde(default = "default_complex_budget")]
    pub complex: BudgetSpec,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            easy: default_easy_budget(),
            normal: default_normal_budget(),
            complex: default_complex_budget(),
        }
    }
}

impl BudgetConfig {
    /// Budget of `complexity`.
    pub fn for_complexity(&self, complexity: Complexity) -> BudgetSpec {
        match complexity {
            Complexity::Easy => self.easy,
            Complexity::Normal => self.normal,
            Complexity::Complex => self.complex,
        }
    }

    /// Set the same timeout on every tier.
    pub fn with_uniform_timeout(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        self.easy.timeout_ms = ms;
        self.normal.timeout_ms = ms;
        self.complex.timeout_ms = ms;
        self
    }
}

/// An independent check re-run by the verification pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Name recorded in verdicts.
    pub name: String,
    /// Categories the check applies to. Empty means all.
    #[serde(default)]
    pub categories: Vec<TaskCategory>,
    /// Program and arguments, run in the task's output directory.
    pub command: Vec<String>,
    /// Kill the check and count it failed after this long.
    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
}

/// Verification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Maximum tolerated share of skipped sub-checks.
    #[serde(default = "default_max_skip_rate")]
    pub max_skip_rate: f64,
    /// Checks the coordinator runs itself.
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_skip_rate: default_max_skip_rate(),
            checks: Vec::new(),
        }
    }
}

/// Retry limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Remediation tasks created per original task.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fresh attempts granted to an environment-blocked task.
    #[serde(default = "default_max_environment_rescans")]
    pub max_environment_rescans: u32,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_environment_rescans: default_max_environment_rescans(),
        }
    }
}

/// Limits on worker-proposed tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpawnerConfig {
    /// Deepest allowed proposal hierarchy.
    #[serde(default = "default_spawn_depth")]
    pub max_depth: u32,
    /// Tasks a single parent may propose over the run.
    #[serde(default = "default_spawn_children")]
    pub max_children: u32,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_depth: default_spawn_depth(),
            max_children: default_spawn_children(),
        }
    }
}

/// External worker command for [`crate::executor::CommandExecutor`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program and arguments. Empty leaves no executor configured.
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra environment for every worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".orchestrator")
}

fn default_max_concurrency() -> usize {
    10
}

fn default_loop_task_cap() -> usize {
    5
}

fn default_max_loops() -> u32 {
    10
}

fn default_easy_budget() -> BudgetSpec {
    BudgetSpec {
        timeout_ms: 10 * 60 * 1000,
        max_turns: 15,
        token_budget: 50_000,
    }
}

fn default_normal_budget() -> BudgetSpec {
    BudgetSpec {
        timeout_ms: 30 * 60 * 1000,
        max_turns: 30,
        token_budget: 150_000,
    }
}

fn default_complex_budget() -> BudgetSpec {
    BudgetSpec {
        timeout_ms: 60 * 60 * 1000,
        max_turns: 60,
        token_budget: 400_000,
    }
}

fn default_check_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_skip_rate() -> f64 {
    0.10
}

fn default_max_attempts() -> u32 {
    1
}

fn default_max_environment_rescans() -> u32 {
    3
}

fn default_spawn_depth() -> u32 {
    3
}

fn default_spawn_children() -> u32 {
    10
}

impl OrchestratorConfig {
    /// Parse and validate TOML.
    pub fn from_toml_str(input: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> ConductorResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConductorError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.loop_task_cap == 0 {
            return Err(ConductorError::Config(
                "loop_task_cap must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.verification.max_skip_rate) {
            return Err(ConductorError::Config(format!(
                "verification.max_skip_rate must be within 0..=1, got {}",
                self.verification.max_skip_rate
            )));
        }
        for complexity in Complexity::ALL {
            if self.budgets.for_complexity(complexity).timeout_ms == 0 {
                return Err(ConductorError::Config(format!(
                    "budgets.{complexity}.timeout_ms must be positive"
                )));
            }
        }
        if let Some(check) = self.verification.checks.iter().find(|c| c.command.is_empty()) {
            return Err(ConductorError::Config(format!(
                "verification check '{}' has an empty command",
                check.name
            )));
        }
        Ok(())
    }

    /// Render as TOML, for `conductor init`.
    pub fn to_toml_string(&self) -> ConductorResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConductorError::Config(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.loop_task_cap, 5);
        assert_eq!(config.state_dir, PathBuf::from(".orchestrator"));
        assert_eq!(config.budgets.for_complexity(Complexity::Normal).timeout_ms, 1_800_000);
        assert_eq!(config.remediation.max_attempts, 1);
        assert_eq!(config.spawner.max_children, 10);
        assert!((config.verification.max_skip_rate - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_override() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
max_concurrency = 3

[budgets.easy]
timeout_ms = 1000
max_turns = 5
token_budget = 10

[[verification.checks]]
name = "cargo-test"
categories = ["build", "test"]
command = ["cargo", "test"]
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.budgets.easy.timeout_ms, 1000);
        assert_eq!(config.budgets.complex.timeout_ms, 3_600_000);
        assert_eq!(config.verification.checks[0].timeout_ms, 300_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(OrchestratorConfig::from_toml_str("max_concurrency = 0").is_err());
        assert!(OrchestratorConfig::from_toml_str("[verification]\nmax_skip_rate = 1.5").is_err());
        assert!(OrchestratorConfig::from_toml_str(
            "[[verification.checks]]\nname = \"x\"\ncommand = []"
        )
        .is_err());
    }

    #[test]
    fn test_defaults_render_and_parse_back() {
        let rendered = OrchestratorConfig::default().to_toml_string().unwrap();
        let parsed = OrchestratorConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.loop_task_cap, 5);
    }
}
