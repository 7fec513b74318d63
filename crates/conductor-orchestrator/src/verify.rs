//! Independent verification of completion records.
//!
//! A worker's claim is never trusted on its own. The pipeline re-derives the
//! outcome from evidence: artifact fingerprints are recomputed, independent
//! checks are re-run, and the worker's sub-check results are weighed against
//! the skip-rate policy. FAIL always wins over BLOCKED.

use crate::config::CheckConfig;
use crate::report::{CheckReport, CheckStatus, ClaimedOutcome, CompletionRecord, ErrorKind, Verdict};
use async_trait::async_trait;
use conductor_core::{ConductorError, TaskCategory, VerdictKind};
use conductor_graph::Task;
use conductor_security::{contained_path, digests_match, fingerprint_file, AuditLog, AuditOutcome};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Exit status a check uses to report that its environment is not ready
/// (`EX_TEMPFAIL`).
pub const ENVIRONMENT_EXIT_CODE: i32 = 75;

const STDERR_TAIL: usize = 2_000;

/// A check the coordinator runs itself against a task's output.
#[async_trait]
pub trait IndependentCheck: Send + Sync {
    /// Name recorded in verdicts and the audit log.
    fn name(&self) -> &str;

    /// Whether the check runs for `task`. Defaults to every task.
    fn applies_to(&self, _task: &Task) -> bool {
        true
    }

    /// Run the check. Launch problems map to `CheckStatus::Error`.
    async fn run(&self, task: &Task, output_dir: &Path) -> CheckStatus;
}

/// Runs a configured command in the attempt's output directory.
pub struct CommandCheck {
    name: String,
    categories: Vec<TaskCategory>,
    command: Vec<String>,
    timeout: Duration,
}

impl CommandCheck {
    /// Build a check from its config entry.
    pub fn from_config(config: &CheckConfig) -> Self {
        Self {
            name: config.name.clone(),
            categories: config.categories.clone(),
            command: config.command.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

fn tail(s: &str, max_len: usize) -> String {
    let s = s.trim();
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut start = s.len() - max_len;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[async_trait]
impl IndependentCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, task: &Task) -> bool {
        self.categories.is_empty() || self.categories.contains(&task.category)
    }

    async fn run(&self, task: &Task, output_dir: &Path) -> CheckStatus {
        let Some((program, args)) = self.command.split_first() else {
            return CheckStatus::Error {
                kind: ErrorKind::Environment,
                detail: format!("check '{}' has no command", self.name),
            };
        };

        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(program)
                .args(args)
                .current_dir(output_dir)
                .env("CONDUCTOR_TASK_ID", task.id.as_str())
                .env("CONDUCTOR_CATEGORY", task.category.to_string())
                .env("CONDUCTOR_OUTPUT_DIR", output_dir)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => CheckStatus::Passed,
            Ok(Ok(output)) if output.status.code() == Some(ENVIRONMENT_EXIT_CODE) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                CheckStatus::Error {
                    kind: ErrorKind::Environment,
                    detail: ConductorError::EnvironmentUnavailable(tail(&stderr, STDERR_TAIL))
                        .to_string(),
                }
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                CheckStatus::Failed {
                    detail: format!(
                        "exit code {}: {}",
                        output.status.code().unwrap_or(-1),
                        tail(&stderr, STDERR_TAIL)
                    ),
                }
            }
            Ok(Err(e)) => CheckStatus::Error {
                kind: ErrorKind::Environment,
                detail: ConductorError::EnvironmentUnavailable(format!(
                    "cannot run '{program}': {e}"
                ))
                .to_string(),
            },
            Err(_) => CheckStatus::Failed {
                detail: format!("timed out after {:?}", self.timeout),
            },
        }
    }
}

/// Adjudicates completion records into verdicts.
pub struct VerificationPipeline {
    checks: Vec<Arc<dyn IndependentCheck>>,
    max_skip_rate: f64,
    audit: Option<Arc<AuditLog>>,
}

impl VerificationPipeline {
    /// Pipeline with no independent checks.
    pub fn new(max_skip_rate: f64) -> Self {
        Self {
            checks: Vec::new(),
            max_skip_rate,
            audit: None,
        }
    }

    /// Add a check the coordinator runs itself.
    pub fn with_check(mut self, check: Arc<dyn IndependentCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Record each verdict in `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Largest tolerated share of skipped checks.
    pub fn max_skip_rate(&self) -> f64 {
        self.max_skip_rate
    }

    /// Produce the verdict for one collected attempt.
    pub async fn verify(
        &self,
        run_id: &str,
        record: &CompletionRecord,
        task: &Task,
        output_dir: &Path,
    ) -> Verdict {
        let verdict = self.adjudicate(run_id, record, task, output_dir).await;
        info!(
            task_id = %task.id,
            attempt = %record.attempt,
            verdict = %verdict.kind,
            skip_rate = verdict.skip_rate,
            reason = %verdict.reason,
            "Verification complete"
        );
        if let Some(audit) = &self.audit {
            audit.log_action(
                run_id,
                Some(task.id.to_string()),
                "verify",
                serde_json::json!({
                    "attempt": record.attempt,
                    "verdict": verdict.kind,
                    "reason": verdict.reason,
                    "skip_rate": verdict.skip_rate,
                }),
                match verdict.kind {
                    VerdictKind::Pass => AuditOutcome::Success,
                    VerdictKind::Fail | VerdictKind::Blocked => AuditOutcome::Denied,
                },
            );
        }
        verdict
    }

    async fn adjudicate(
        &self,
        run_id: &str,
        record: &CompletionRecord,
        task: &Task,
        output_dir: &Path,
    ) -> Verdict {
        let report = &record.report;
        let mut evidence = Vec::new();
        let mut failures = Vec::new();
        // Re-hashed artifacts and coordinator-run checks. Worker sub-checks
        // never count toward a PASS.
        let mut verified = 0usize;

        for artifact in &report.artifacts {
            let Some(path) = contained_path(output_dir, &artifact.path) else {
                let detail = "path escapes output directory";
                return self.tampered(run_id, task, &artifact.path, detail, evidence);
            };
            match fingerprint_file(&path).await {
                Ok(actual) if digests_match(&artifact.sha256, &actual) => {
                    verified += 1;
                    evidence.push(format!("artifact {}: sha256 {actual}", artifact.path));
                }
                Ok(actual) => {
                    let detail = format!("reported {} but found {actual}", artifact.sha256);
                    return self.tampered(run_id, task, &artifact.path, &detail, evidence);
                }
                Err(e) => {
                    evidence.push(format!("artifact {}: unreadable ({e})", artifact.path));
                    failures.push(format!("artifact {} missing", artifact.path));
                }
            }
        }

        let mut checks: Vec<CheckReport> = report.checks.clone();
        for check in self.checks.iter().filter(|c| c.applies_to(task)) {
            let status = check.run(task, output_dir).await;
            if status == CheckStatus::Passed {
                verified += 1;
            }
            checks.push(CheckReport::new(format!("independent:{}", check.name()), status));
        }
        for check in &checks {
            evidence.push(format!("check {}: {}", check.name, describe(&check.status)));
        }

        let skipped = checks.iter().filter(|c| c.status.is_skip()).count();
        let skip_rate = if checks.is_empty() {
            0.0
        } else {
            skipped as f64 / checks.len() as f64
        };

        if report.outcome == ClaimedOutcome::ClaimedFailure {
            failures.push("worker reported failure".to_string());
        }
        if report.artifacts.is_empty() && checks.is_empty() {
            failures.push("no evidence supplied".to_string());
        }

        let mut environmental = Vec::new();
        for check in &checks {
            match &check.status {
                CheckStatus::Failed { detail } => {
                    failures.push(format!("check {} failed: {detail}", check.name));
                }
                CheckStatus::Error {
                    kind: ErrorKind::Implementation,
                    detail,
                } => failures.push(format!("check {} errored: {detail}", check.name)),
                CheckStatus::Error {
                    kind: ErrorKind::Environment,
                    detail,
                } => environmental.push(format!("check {}: {detail}", check.name)),
                CheckStatus::Passed | CheckStatus::Skipped { .. } => {}
            }
        }

        let over_threshold = skip_rate > self.max_skip_rate;
        let env_skips = checks
            .iter()
            .any(|c| c.status.is_skip() && c.status.is_environmental());
        if over_threshold && !env_skips {
            failures.push(format!(
                "skip rate {:.0}% exceeds {:.0}%",
                skip_rate * 100.0,
                self.max_skip_rate * 100.0
            ));
        }

        let (kind, reason) = if !failures.is_empty() {
            (VerdictKind::Fail, failures.join("; "))
        } else if !environmental.is_empty() {
            (VerdictKind::Blocked, environmental.join("; "))
        } else if over_threshold {
            (
                VerdictKind::Blocked,
                format!(
                    "skip rate {:.0}% exceeds {:.0}% with environment skips",
                    skip_rate * 100.0,
                    self.max_skip_rate * 100.0
                ),
            )
        } else if verified == 0 {
            (
                VerdictKind::Fail,
                "no independently verified evidence (only worker-reported checks)".to_string(),
            )
        } else {
            (VerdictKind::Pass, "evidence verified".to_string())
        };

        Verdict {
            kind,
            reason,
            evidence,
            skip_rate,
            tampered: false,
        }
    }

    fn tampered(
        &self,
        run_id: &str,
        task: &Task,
        artifact: &str,
        detail: &str,
        mut evidence: Vec<String>,
    ) -> Verdict {
        let error = ConductorError::EvidenceTamper {
            task: task.id.clone(),
            artifact: artifact.to_string(),
        };
        warn!(task_id = %task.id, artifact, detail, "{error}");
        if let Some(audit) = &self.audit {
            audit.log_action(
                run_id,
                Some(task.id.to_string()),
                "evidence_tamper",
                serde_json::json!({ "artifact": artifact, "detail": detail }),
                AuditOutcome::Tamper,
            );
        }
        evidence.push(format!("artifact {artifact}: {detail}"));
        Verdict {
            kind: VerdictKind::Fail,
            reason: error.to_string(),
            evidence,
            skip_rate: 0.0,
            tampered: true,
        }
    }
}

fn describe(status: &CheckStatus) -> String {
    match status {
        CheckStatus::Passed => "passed".to_string(),
        CheckStatus::Failed { detail } => format!("failed ({detail})"),
        CheckStatus::Skipped { reason } => format!("skipped ({reason:?})"),
        CheckStatus::Error { kind, detail } => format!("error {kind:?} ({detail})"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::report::{SkipReason, WorkerReport};
    use conductor_security::fingerprint;
    use tempfile::TempDir;

    fn task() -> Task {
        Task::new("BUILD-001", TaskCategory::Build, "build it")
    }

    fn record(report: WorkerReport) -> CompletionRecord {
        CompletionRecord::new("BUILD-001".into(), uuid::Uuid::new_v4(), report)
    }

    fn sh(name: &str, script: &str, timeout_ms: u64) -> Arc<dyn IndependentCheck> {
        Arc::new(CommandCheck::from_config(&CheckConfig {
            name: name.into(),
            categories: vec![],
            command: vec!["sh".into(), "-c".into(), script.into()],
            timeout_ms,
        }))
    }

    async fn with_artifact(tmp: &TempDir) -> WorkerReport {
        tokio::fs::write(tmp.path().join("out.txt"), b"result").await.unwrap();
        WorkerReport::success("done").with_artifact("out.txt", fingerprint(b"result"))
    }

    #[tokio::test]
    async fn test_matching_artifact_passes() {
        let tmp = TempDir::new().unwrap();
        let report = with_artifact(&tmp).await;
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Pass);
        assert!(!verdict.tampered);
    }

    #[tokio::test]
    async fn test_modified_artifact_is_tamper() {
        let tmp = TempDir::new().unwrap();
        let report = with_artifact(&tmp).await;
        tokio::fs::write(tmp.path().join("out.txt"), b"forged").await.unwrap();

        let audit = Arc::new(AuditLog::new(tmp.path().join("audit")));
        let verdict = VerificationPipeline::new(0.1)
            .with_audit(audit.clone())
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
        assert!(verdict.tampered);

        audit.flush().await;
        let entries = audit.entries().await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.action == "evidence_tamper" && e.outcome == AuditOutcome::Tamper));
    }

    #[tokio::test]
    async fn test_tamper_fails_even_when_everything_else_passes() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done")
            .with_artifact("out.txt", "00")
            .with_check("unit", CheckStatus::Passed);
        tokio::fs::write(tmp.path().join("out.txt"), b"x").await.unwrap();
        let verdict = VerificationPipeline::new(1.0)
            .with_check(sh("ok", "exit 0", 5_000))
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
        assert!(verdict.tampered);
    }

    #[tokio::test]
    async fn test_escaping_artifact_path_is_tamper() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done").with_artifact("../etc/passwd", "00");
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert!(verdict.tampered);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done").with_artifact("absent.txt", "00");
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
        assert!(!verdict.tampered);
    }

    #[tokio::test]
    async fn test_claim_without_evidence_fails() {
        let tmp = TempDir::new().unwrap();
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(WorkerReport::success("trust me")), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
    }

    #[tokio::test]
    async fn test_worker_reported_checks_alone_do_not_pass() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("trust me").with_check("unit", CheckStatus::Passed);
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report.clone()), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
        assert!(verdict.reason.contains("independently verified"));

        let verdict = VerificationPipeline::new(0.1)
            .with_check(sh("rerun", "exit 0", 5_000))
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Pass);
    }

    #[tokio::test]
    async fn test_environment_skips_over_threshold_block() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done")
            .with_check("unit", CheckStatus::Passed)
            .with_check(
                "smtp",
                CheckStatus::Skipped {
                    reason: SkipReason::Environment,
                },
            );
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Blocked);
        assert!((verdict.skip_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_other_skips_over_threshold_fail() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done")
            .with_check("unit", CheckStatus::Passed)
            .with_check(
                "lint",
                CheckStatus::Skipped {
                    reason: SkipReason::Other,
                },
            );
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
    }

    #[tokio::test]
    async fn test_fail_dominates_blocked() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done")
            .with_check(
                "unit",
                CheckStatus::Failed {
                    detail: "assertion".into(),
                },
            )
            .with_check(
                "db",
                CheckStatus::Error {
                    kind: ErrorKind::Environment,
                    detail: "refused".into(),
                },
            );
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
    }

    #[tokio::test]
    async fn test_claimed_failure_fails() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::failure("gave up").with_check("unit", CheckStatus::Passed);
        let verdict = VerificationPipeline::new(0.1)
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
    }

    #[tokio::test]
    async fn test_independent_check_outcomes() {
        let tmp = TempDir::new().unwrap();
        let t = task();
        assert_eq!(sh("ok", "exit 0", 5_000).run(&t, tmp.path()).await, CheckStatus::Passed);
        assert!(sh("env", "exit 75", 5_000).run(&t, tmp.path()).await.is_environmental());
        assert!(matches!(
            sh("bad", "echo broken >&2; exit 1", 5_000).run(&t, tmp.path()).await,
            CheckStatus::Failed { detail } if detail.contains("broken")
        ));
        assert!(matches!(
            sh("slow", "sleep 5", 50).run(&t, tmp.path()).await,
            CheckStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_independent_failure_overrides_worker_claim() {
        let tmp = TempDir::new().unwrap();
        let report = WorkerReport::success("done").with_check("unit", CheckStatus::Passed);
        let verdict = VerificationPipeline::new(0.1)
            .with_check(sh("rerun", "exit 1", 5_000))
            .verify("run", &record(report), &task(), tmp.path())
            .await;
        assert_eq!(verdict.kind, VerdictKind::Fail);
        assert!(verdict.evidence.iter().any(|e| e.contains("independent:rerun")));
    }

    #[test]
    fn test_check_category_filter() {
        let check = CommandCheck::from_config(&CheckConfig {
            name: "cargo-test".into(),
            categories: vec![TaskCategory::Test],
            command: vec!["true".into()],
            timeout_ms: 1_000,
        });
        assert!(!check.applies_to(&task()));
        assert!(check.applies_to(&Task::new("T", TaskCategory::Test, "t")));
    }
}
