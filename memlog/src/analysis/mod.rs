//! Analysis of heap snapshots
//!
//! Pure functions over [`crate::tracker::Snapshot`], shared by the daemon's
//! status output and the heap dump exporter.

pub mod top_backtraces;

pub use top_backtraces::{
    context_breakdown, format_frames, top_backtraces, BacktraceSummary, ContextSummary,
};
