//! Task graph for the Conductor orchestrator.
//!
//! Holds the task model, the dependency graph with its eligibility and
//! critical-path queries, the durable [`GraphStore`] implementations, and the
//! decomposition of specification documents into tasks.
//!
//! # Main types
//!
//! - [`Task`] — A schedulable unit of work with its status history.
//! - [`TaskGraph`] — Tasks plus edges; enforces acyclicity and referential integrity.
//! - [`GraphStore`] — Async store trait with compare-and-set status updates.
//! - [`FileGraphStore`] — `graph.json` store with atomic writes and a markdown view.
//! - [`SpecDocument`] — TOML/JSON specification input for decomposition.

/// Specification documents and their decomposition into tasks.
pub mod decompose;
/// Dependency graph and status transitions.
pub mod graph;
/// Markdown rendering of the task queue.
pub mod markdown;
/// Durable graph stores.
pub mod store;
/// The task model.
pub mod task;

pub use decompose::{FeatureSpec, SpecDocument, TaskSpec, TestKind, TestSpec};
pub use graph::{StatusCounts, StatusUpdate, TaskGraph};
pub use markdown::render_task_queue;
pub use store::{FileGraphStore, GraphStore, MemoryGraphStore};
pub use task::{BlockReason, FailureKind, StatusChange, Task, TaskFailure};
