//! Specification decomposition.
//!
//! A specification document lists features (each becomes a `build` task),
//! tests (each becomes a `test` task that depends on its feature) and
//! optional raw tasks. Decomposition is all-or-nothing: malformed input yields
//! an error and zero tasks.

use crate::graph::TaskGraph;
use crate::task::Task;
use conductor_core::{Complexity, ConductorError, ConductorResult, Priority, TaskCategory};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

/// A feature to implement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// Task id, unique across the document.
    pub id: String,
    /// Short title. Defaults to the id.
    #[serde(default)]
    pub title: String,
    /// What the build task must achieve.
    pub objective: String,
    /// Conditions the result is verified against.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Ids of other features or raw tasks.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Selects the execution budget.
    #[serde(default)]
    pub complexity: Complexity,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Ordered implementation steps.
    #[serde(default)]
    pub steps: Vec<String>,
}

/// Test level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Unit test.
    #[default]
    Unit,
    /// Integration test.
    Integration,
    /// End-to-end test.
    E2e,
    /// Manual check performed by a worker.
    Manual,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Unit => write!(f, "unit"),
            TestKind::Integration => write!(f, "integration"),
            TestKind::E2e => write!(f, "e2e"),
            TestKind::Manual => write!(f, "manual"),
        }
    }
}

/// A test attached to a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Task id, unique across the document.
    pub id: String,
    /// Feature under test.
    pub feature: String,
    /// Test level.
    #[serde(default)]
    pub kind: TestKind,
    /// Short title. Defaults to a generated one.
    #[serde(default)]
    pub title: String,
    /// Overrides the generated objective.
    #[serde(default)]
    pub objective: Option<String>,
    /// Conditions the test must establish.
    #[serde(default)]
    pub criteria: Vec<String>,
    /// Selects the execution budget.
    #[serde(default)]
    pub complexity: Complexity,
    /// Extra dependencies beyond the feature itself.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A task given verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task id, unique across the document.
    pub id: String,
    /// Short title. Defaults to the id.
    #[serde(default)]
    pub title: String,
    /// Worker category that runs the task.
    pub category: TaskCategory,
    /// What the task must achieve.
    pub objective: String,
    /// Conditions the result is verified against.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Ids of tasks this one waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Selects the execution budget.
    #[serde(default)]
    pub complexity: Complexity,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Ordered implementation steps.
    #[serde(default)]
    pub steps: Vec<String>,
}

/// A specification document in TOML or JSON.
///
/// ```toml
/// name = "vulndash"
///
/// [[features]]
/// id = "BUILD-001"
/// objective = "Implement the health endpoint"
/// acceptance_criteria = ["GET /health returns 200"]
///
/// [[tests]]
/// id = "TEST-001"
/// feature = "BUILD-001"
/// kind = "integration"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecDocument {
    /// Document name, recorded on the run.
    #[serde(default)]
    pub name: String,
    /// Features, each decomposed into a build task.
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
    /// Tests, each decomposed into a test task.
    #[serde(default)]
    pub tests: Vec<TestSpec>,
    /// Tasks taken as given.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[allow(clippy::expect_used)]
fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid task id regex")
    })
}

fn malformed(msg: impl Into<String>) -> ConductorError {
    ConductorError::Decomposition(msg.into())
}

impl SpecDocument {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> ConductorResult<Self> {
        toml::from_str(input).map_err(|e| malformed(format!("invalid TOML specification: {e}")))
    }

    /// Parse a JSON document.
    pub fn from_json_str(input: &str) -> ConductorResult<Self> {
        serde_json::from_str(input)
            .map_err(|e| malformed(format!("invalid JSON specification: {e}")))
    }

    /// Load a document, choosing the format by file extension (`.json` or TOML).
    pub async fn load(path: &Path) -> ConductorResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Turn the document into tasks. Either every task is returned or an error.
    pub fn decompose(&self) -> ConductorResult<Vec<Task>> {
        if self.features.is_empty() && self.tasks.is_empty() {
            return Err(malformed("specification contains no features or tasks"));
        }

        let mut ids = HashSet::new();
        let all_ids = self
            .features
            .iter()
            .map(|f| &f.id)
            .chain(self.tests.iter().map(|t| &t.id))
            .chain(self.tasks.iter().map(|t| &t.id));
        for id in all_ids {
            if !id_pattern().is_match(id) {
                return Err(malformed(format!("invalid task id '{id}'")));
            }
            if !ids.insert(id.as_str()) {
                return Err(malformed(format!("duplicate id '{id}'")));
            }
        }

        let features: HashSet<&str> = self.features.iter().map(|f| f.id.as_str()).collect();
        let check_refs = |owner: &str, deps: &[String]| -> ConductorResult<()> {
            for dep in deps {
                if !ids.contains(dep.as_str()) {
                    return Err(malformed(format!("'{owner}' depends on unknown id '{dep}'")));
                }
            }
            Ok(())
        };

        let mut tasks = Vec::new();
        for feature in &self.features {
            if feature.objective.trim().is_empty() {
                return Err(malformed(format!("feature '{}' has an empty objective", feature.id)));
            }
            check_refs(&feature.id, &feature.depends_on)?;
            tasks.push(
                Task::new(feature.id.as_str(), TaskCategory::Build, feature.objective.clone())
                    .with_title(feature.title.clone())
                    .with_complexity(feature.complexity)
                    .with_priority(feature.priority)
                    .with_dependencies(feature.depends_on.iter().map(String::as_str))
                    .with_acceptance_criteria(feature.acceptance_criteria.clone())
                    .with_steps(feature.steps.clone()),
            );
        }

        for test in &self.tests {
            if !features.contains(test.feature.as_str()) {
                return Err(malformed(format!(
                    "test '{}' references unknown feature '{}'",
                    test.id, test.feature
                )));
            }
            check_refs(&test.id, &test.depends_on)?;
            let feature_title = self
                .features
                .iter()
                .find(|f| f.id == test.feature)
                .map(|f| if f.title.is_empty() { f.id.as_str() } else { f.title.as_str() })
                .unwrap_or(test.feature.as_str());
            let objective = test.objective.clone().unwrap_or_else(|| {
                format!("Write and run {} tests for {feature_title}", test.kind)
            });
            let title = if test.title.is_empty() {
                format!("{} tests: {feature_title}", test.kind)
            } else {
                test.title.clone()
            };
            let deps = std::iter::once(test.feature.as_str())
                .chain(test.depends_on.iter().map(String::as_str));
            tasks.push(
                Task::new(test.id.as_str(), TaskCategory::Test, objective)
                    .with_title(title)
                    .with_complexity(test.complexity)
                    .with_dependencies(deps)
                    .with_acceptance_criteria(test.criteria.clone()),
            );
        }

        for raw in &self.tasks {
            if raw.objective.trim().is_empty() {
                return Err(malformed(format!("task '{}' has an empty objective", raw.id)));
            }
            check_refs(&raw.id, &raw.depends_on)?;
            tasks.push(
                Task::new(raw.id.as_str(), raw.category, raw.objective.clone())
                    .with_title(raw.title.clone())
                    .with_complexity(raw.complexity)
                    .with_priority(raw.priority)
                    .with_dependencies(raw.depends_on.iter().map(String::as_str))
                    .with_acceptance_criteria(raw.acceptance_criteria.clone())
                    .with_steps(raw.steps.clone()),
            );
        }

        // Cycle check against a scratch graph; the caller's graph is untouched.
        TaskGraph::new().add_all(tasks.clone())?;

        info!(
            spec = %self.name,
            features = self.features.len(),
            tests = self.tests.len(),
            tasks = tasks.len(),
            "Specification decomposed"
        );
        Ok(tasks)
    }
}
