//! Per-process allocation state
//!
//! - `allocation_tracker`: live allocations, barriers and completion
//! - `backtrace_storage`: the interning seam and its default arena
//! - `snapshot`: copy-out heap views handed to callers

pub mod allocation_tracker;
pub mod backtrace_storage;
pub mod snapshot;

pub use allocation_tracker::{AllocationTracker, TrackerStats};
pub use backtrace_storage::{BacktraceHandle, BacktraceStorage, InternedBacktraces};
pub use snapshot::{AllocationView, BacktraceGroup, Snapshot, SnapshotAllocation};

use crate::domain::DumpError;

/// Outcome of every snapshot request
pub type DumpResult = Result<Snapshot, DumpError>;

/// One-shot receiver of a snapshot outcome
pub type SnapshotCallback = Box<dyn FnOnce(DumpResult) + Send>;
