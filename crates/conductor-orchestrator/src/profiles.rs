use crate::config::BudgetConfig;
use conductor_core::{Complexity, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Persona handed to a worker, selected by task category.
///
/// The prompt is opaque to the orchestrator; it is forwarded to the executor
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Category the profile serves.
    pub category: TaskCategory,
    /// Instructions forwarded to the worker.
    pub system_prompt: String,
    /// Tool names the worker may use.
    pub allowed_tools: Vec<String>,
    /// Turn limit for this category.
    pub max_turns: u32,
}

/// Resource limits for one attempt, selected by complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBudget {
    /// Tier the budget was taken from.
    pub complexity: Complexity,
    /// Time before the attempt is timed out.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Turn limit for the worker.
    pub max_turns: u32,
    /// Token limit for the worker.
    pub token_budget: u64,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Budgets for every complexity tier.
#[derive(Debug, Clone)]
pub struct BudgetTable {
    budgets: HashMap<Complexity, ExecutionBudget>,
}

impl BudgetTable {
    /// Budgets from the `[budgets]` config section.
    pub fn from_config(config: &BudgetConfig) -> Self {
        let budgets = Complexity::ALL
            .into_iter()
            .map(|complexity| {
                let spec = config.for_complexity(complexity);
                (
                    complexity,
                    ExecutionBudget {
                        complexity,
                        timeout: Duration::from_millis(spec.timeout_ms),
                        max_turns: spec.max_turns,
                        token_budget: spec.token_budget,
                    },
                )
            })
            .collect();
        Self { budgets }
    }

    /// Budget of `complexity`.
    pub fn for_complexity(&self, complexity: Complexity) -> ExecutionBudget {
        self.budgets.get(&complexity).copied().unwrap_or(ExecutionBudget {
            complexity,
            timeout: Duration::from_secs(30 * 60),
            max_turns: 30,
            token_budget: 150_000,
        })
    }
}

impl Default for BudgetTable {
    fn default() -> Self {
        Self::from_config(&BudgetConfig::default())
    }
}

/// Create default worker profiles, one per category.
pub fn default_profiles() -> Vec<WorkerProfile> {
    vec![
        profile(TaskCategory::Build, BUILD_PROMPT, &["read", "write", "edit", "shell"], 40),
        profile(TaskCategory::Test, TEST_PROMPT, &["read", "write", "shell"], 30),
        profile(TaskCategory::Verify, VERIFY_PROMPT, &["read", "shell"], 20),
        profile(TaskCategory::Decompose, DECOMPOSE_PROMPT, &["read"], 15),
        profile(TaskCategory::Research, RESEARCH_PROMPT, &["read", "web_search"], 25),
        profile(TaskCategory::Analyze, ANALYZE_PROMPT, &["read"], 15),
    ]
}

fn profile(
    category: TaskCategory,
    prompt: &str,
    tools: &[&str],
    max_turns: u32,
) -> WorkerProfile {
    WorkerProfile {
        category,
        system_prompt: prompt.to_string(),
        allowed_tools: tools.iter().map(ToString::to_string).collect(),
        max_turns,
    }
}

/// Profiles keyed by category.
pub fn profile_map(profiles: Vec<WorkerProfile>) -> HashMap<TaskCategory, WorkerProfile> {
    profiles.into_iter().map(|p| (p.category, p)).collect()
}

const BUILD_PROMPT: &str = "You implement one task. Write the code, run it, and report \
evidence for every acceptance criterion. Record each produced artifact with its SHA-256.";

const TEST_PROMPT: &str = "You write and run tests for one feature. Report every check \
you ran with its status. A skipped check must say why it was skipped.";

const VERIFY_PROMPT: &str = "You re-check another task's output adversarially. Assume the \
claim is false until the evidence reproduces.";

const DECOMPOSE_PROMPT: &str = "You split a goal into small, independently verifiable tasks. \
Propose them with explicit dependencies.";

const RESEARCH_PROMPT: &str = "You investigate gaps between the goal and the current state \
and propose new tasks for the next loop.";

const ANALYZE_PROMPT: &str = "You analyse the results of previous loops and summarise \
recurring failures.";
