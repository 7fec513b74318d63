//! Run ledger and analytics for the Conductor orchestrator.
//!
//! Every adjudicated task attempt is appended to a per-run JSONL ledger. The
//! summary functions project those entries into per-category, per-complexity
//! and per-loop breakdowns.
//!
//! # Main types
//!
//! - [`LedgerEntry`] — One adjudicated attempt.
//! - [`LedgerStore`] / [`FileLedger`] — Append-only storage.
//! - [`RunSummary`] — Deterministic run report, renderable as JSON or markdown.

/// Ledger rows.
pub mod entry;
/// Ledger storage.
pub mod store;
/// Pure run analytics.
pub mod summary;

pub use entry::LedgerEntry;
pub use store::{FileLedger, LedgerStore};
pub use summary::{
    summarize, summarize_history, HistorySummary, RunOverview, RunSummary, SlowTask, Tally,
};
