//! Core types and error definitions for the Conductor task orchestrator.
//!
//! This crate provides the foundational types shared across all Conductor crates:
//! the error taxonomy, the closed enumerations that drive scheduling decisions,
//! and the atomic file helpers every durable store is built on.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`TaskId`] — Stable, human-readable task identifier.
//! - [`TaskStatus`] — Lifecycle state of a task, including the legal transitions.
//! - [`TaskCategory`] / [`Complexity`] / [`Priority`] — Scheduling attributes.
//! - [`VerdictKind`] — Independent verification outcome.
//! - [`Cost`] — Resource usage reported for one task attempt.

/// Error taxonomy.
pub mod error;
/// Atomic, durable file writes.
pub mod persist;
/// Shared domain enumerations and identifiers.
pub mod types;

pub use error::{ConductorError, ConductorResult};
pub use types::{
    AttemptId, Complexity, Cost, Priority, TaskCategory, TaskId, TaskStatus, VerdictKind,
};
