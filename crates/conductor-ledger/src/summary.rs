//! Run analytics.
//!
//! Summaries are pure projections of ledger entries. They contain no
//! wall-clock fields and use ordered maps throughout, so summarizing the same
//! entries twice yields byte-identical output.

use crate::entry::LedgerEntry;
use conductor_core::{Complexity, Cost, TaskCategory, TaskId, VerdictKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

const SLOWEST_LIMIT: usize = 5;

/// Verdict counts for one slice of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    /// Adjudications counted.
    pub total: u64,
    /// PASS verdicts.
    pub passed: u64,
    /// FAIL verdicts.
    pub failed: u64,
    /// BLOCKED verdicts.
    pub blocked: u64,
    /// `passed / total`, 0.0 when empty.
    pub pass_rate: f64,
}

impl Tally {
    fn record(&mut self, verdict: VerdictKind) {
        self.total += 1;
        match verdict {
            VerdictKind::Pass => self.passed += 1,
            VerdictKind::Fail => self.failed += 1,
            VerdictKind::Blocked => self.blocked += 1,
        }
        self.pass_rate = self.passed as f64 / self.total as f64;
    }
}

/// One of the slowest adjudicated attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowTask {
    /// Task that was attempted.
    pub task_id: TaskId,
    /// Loop of the attempt.
    pub loop_number: u32,
    /// Worker time reported.
    pub duration_ms: u64,
    /// Tokens reported.
    pub tokens: u64,
}

/// Aggregate view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run being summarized.
    pub run_id: String,
    /// Counts across the whole run.
    pub totals: Tally,
    /// Counts per worker category.
    pub by_category: BTreeMap<TaskCategory, Tally>,
    /// Counts per complexity tier.
    pub by_complexity: BTreeMap<Complexity, Tally>,
    /// Counts per loop.
    pub by_loop: BTreeMap<u32, Tally>,
    /// Summed worker cost.
    pub cost: Cost,
    /// Longest attempts, slowest first.
    pub slowest: Vec<SlowTask>,
}

/// Summarize the entries of one run.
pub fn summarize(run_id: &str, entries: &[LedgerEntry]) -> RunSummary {
    let mut totals = Tally::default();
    let mut by_category: BTreeMap<TaskCategory, Tally> = BTreeMap::new();
    let mut by_complexity: BTreeMap<Complexity, Tally> = BTreeMap::new();
    let mut by_loop: BTreeMap<u32, Tally> = BTreeMap::new();
    let mut cost = Cost::default();

    for entry in entries {
        totals.record(entry.verdict);
        by_category.entry(entry.category).or_default().record(entry.verdict);
        by_complexity
            .entry(entry.complexity)
            .or_default()
            .record(entry.verdict);
        by_loop.entry(entry.loop_number).or_default().record(entry.verdict);
        cost = cost.add(entry.cost);
    }

    let mut slowest: Vec<SlowTask> = entries
        .iter()
        .map(|e| SlowTask {
            task_id: e.task_id.clone(),
            loop_number: e.loop_number,
            duration_ms: e.cost.duration_ms,
            tokens: e.cost.tokens,
        })
        .collect();
    slowest.sort_by(|a, b| {
        b.duration_ms
            .cmp(&a.duration_ms)
            .then_with(|| a.task_id.cmp(&b.task_id))
            .then_with(|| a.loop_number.cmp(&b.loop_number))
    });
    slowest.truncate(SLOWEST_LIMIT);

    RunSummary {
        run_id: run_id.to_string(),
        totals,
        by_category,
        by_complexity,
        by_loop,
        cost,
        slowest,
    }
}

impl RunSummary {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Operator-facing report.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Run {}\n", self.run_id);
        let _ = writeln!(
            out,
            "{} adjudications: {} PASS, {} FAIL, {} BLOCKED (pass rate {:.1}%)\n",
            self.totals.total,
            self.totals.passed,
            self.totals.failed,
            self.totals.blocked,
            self.totals.pass_rate * 100.0
        );
        let _ = writeln!(
            out,
            "Cost: {} tokens, {:.1}s worker time\n",
            self.cost.tokens,
            self.cost.duration_ms as f64 / 1000.0
        );

        tally_table(&mut out, "Category", &self.by_category);
        tally_table(&mut out, "Complexity", &self.by_complexity);
        tally_table(&mut out, "Loop", &self.by_loop);

        if !self.slowest.is_empty() {
            let _ = writeln!(out, "## Slowest tasks\n");
            let _ = writeln!(out, "| Task | Loop | Duration (ms) | Tokens |");
            let _ = writeln!(out, "|------|------|---------------|--------|");
            for slow in &self.slowest {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} |",
                    slow.task_id, slow.loop_number, slow.duration_ms, slow.tokens
                );
            }
        }
        out
    }
}

fn tally_table<K: std::fmt::Display>(out: &mut String, label: &str, rows: &BTreeMap<K, Tally>) {
    if rows.is_empty() {
        return;
    }
    let _ = writeln!(out, "## By {}\n", label.to_lowercase());
    let _ = writeln!(out, "| {label} | Total | PASS | FAIL | BLOCKED | Pass rate |");
    let _ = writeln!(out, "|---|---|---|---|---|---|");
    for (key, t) in rows {
        let _ = writeln!(
            out,
            "| {key} | {} | {} | {} | {} | {:.1}% |",
            t.total,
            t.passed,
            t.failed,
            t.blocked,
            t.pass_rate * 100.0
        );
    }
    out.push('\n');
}

/// Totals for one run inside a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOverview {
    /// Run id.
    pub run_id: String,
    /// Counts across the run.
    pub totals: Tally,
    /// Summed worker cost.
    pub cost: Cost,
}

/// Aggregate across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    /// One overview per run, in run order.
    pub runs: Vec<RunOverview>,
    /// All entries of all runs summarized together.
    pub combined: RunSummary,
}

impl HistorySummary {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Summarize several runs, given as `(run_id, entries)` pairs.
pub fn summarize_history(runs: &[(String, Vec<LedgerEntry>)]) -> HistorySummary {
    let overviews = runs
        .iter()
        .map(|(run_id, entries)| {
            let summary = summarize(run_id, entries);
            RunOverview {
                run_id: summary.run_id,
                totals: summary.totals,
                cost: summary.cost,
            }
        })
        .collect();
    let all: Vec<LedgerEntry> = runs.iter().flat_map(|(_, e)| e.iter().cloned()).collect();
    HistorySummary {
        runs: overviews,
        combined: summarize("all", &all),
    }
}
