//! Human-readable task queue view.
//!
//! Each task becomes a section with a metadata table followed by prose. The
//! file is regenerated from `graph.json` after every write and is never read
//! back as state.

use crate::graph::TaskGraph;
use crate::task::Task;
use std::fmt::Write;

/// Render the whole graph in insertion order.
pub fn render_task_queue(graph: &TaskGraph) -> String {
    let counts = graph.counts();
    let mut out = String::new();
    let _ = writeln!(out, "# Task Queue\n");
    let _ = writeln!(
        out,
        "{} tasks: {} pending, {} in progress, {} completed, {} failed, {} blocked\n",
        counts.total(),
        counts.pending,
        counts.in_progress,
        counts.completed,
        counts.failed,
        counts.blocked
    );

    for task in graph.tasks() {
        render_task(&mut out, task, graph.is_superseded(&task.id));
    }
    out
}

fn render_task(out: &mut String, task: &Task, superseded: bool) {
    let _ = writeln!(out, "### {}: {}\n", task.id, task.display_title());
    let _ = writeln!(out, "| Field | Value |");
    let _ = writeln!(out, "|-------|-------|");
    let _ = writeln!(out, "| Priority | {} |", task.priority);
    let status = if superseded {
        format!("{} (superseded)", task.status)
    } else {
        task.status.to_string()
    };
    let _ = writeln!(out, "| Status | {status} |");
    let _ = writeln!(out, "| Category | {} |", task.category);
    let _ = writeln!(out, "| Complexity | {} |", task.complexity);
    let deps = if task.dependencies.is_empty() {
        "None".to_string()
    } else {
        task.dependencies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(out, "| Depends On | {deps} |");
    if let Some(previous) = &task.supersedes {
        let _ = writeln!(out, "| Supersedes | {previous} |");
    }
    if let Some(reason) = &task.block_reason {
        let _ = writeln!(out, "| Blocked By | {reason} |");
    }
    if let Some(failure) = &task.failure {
        let _ = writeln!(out, "| Failure | {}: {} |", failure.kind, failure.detail);
    }

    let _ = writeln!(out, "\n---\n");
    let _ = writeln!(out, "**Description:**\n{}\n", task.objective);
    if !task.steps.is_empty() {
        let _ = writeln!(out, "**Steps:**");
        for (i, step) in task.steps.iter().enumerate() {
            let _ = writeln!(out, "{}. {step}", i + 1);
        }
        out.push('\n');
    }
    if !task.acceptance_criteria.is_empty() {
        let _ = writeln!(out, "**Expected Result:**");
        for criterion in &task.acceptance_criteria {
            let _ = writeln!(out, "- {criterion}");
        }
        out.push('\n');
    }
}
