//! Security primitives for the Conductor orchestrator.
//!
//! Provides evidence fingerprinting and the append-only audit trail that the
//! verification pipeline writes to.
//!
//! # Main types
//!
//! - [`AuditLog`] — Append-only audit trail persisted to disk.
//! - [`fingerprint()`] — SHA-256 digests of evidence artifacts.

/// Audit logging module.
pub mod audit;
/// Evidence fingerprints and path containment.
pub mod fingerprint;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use fingerprint::{contained_path, digests_match, fingerprint, fingerprint_file};
