//! Heap composition summaries.
//!
//! Ranks the backtraces and contexts of a [`Snapshot`] by live bytes, the
//! first thing anyone looks at in a heap dump.
//!
//! ```text
//! TOP BACKTRACES (pid 4242, 18.3 MiB live)
//! ─────────────────────────────────────────
//!   0x55d0c0a1f2e0 ← 0x55d0c0a1e010   61.2%  11.2 MiB  (204 allocs)
//!   0x55d0c0a3b7a8 ← 0x55d0c0a1e010   20.4%   3.7 MiB  (9 allocs)
//! ```
//!
//! # Performance
//!
//! - `top_backtraces()`: O(g log g) where g = backtrace groups (sorting)
//! - `context_breakdown()`: O(n) over live allocations

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{ContextId, Frame};
use crate::tracker::Snapshot;

/// One backtrace with its share of the live heap
#[derive(Debug, Clone, PartialEq)]
pub struct BacktraceSummary {
    /// Innermost frame first
    pub frames: Arc<[Frame]>,

    /// Live allocations made from this backtrace
    pub count: usize,

    /// Live bytes made from this backtrace
    pub bytes: u64,

    /// Share of all live bytes (0.0 - 100.0)
    pub percentage: f64,
}

/// Live bytes attributed to one allocation context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSummary {
    /// `None` collects allocations sent without a context
    pub name: Option<String>,
    pub count: usize,
    pub bytes: u64,
    pub percentage: f64,
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// The `limit` backtraces holding the most live bytes, largest first.
///
/// Ties are broken by allocation count, then by frames, so the ranking is
/// stable across runs.
#[must_use]
pub fn top_backtraces(snapshot: &Snapshot, limit: usize) -> Vec<BacktraceSummary> {
    let total = snapshot.live_bytes();

    let mut summaries: Vec<BacktraceSummary> = snapshot
        .groups
        .iter()
        .map(|group| {
            let bytes = group.total_bytes();
            BacktraceSummary {
                frames: Arc::clone(&group.frames),
                count: group.count(),
                bytes,
                percentage: percentage(bytes, total),
            }
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.bytes.cmp(&a.bytes).then(b.count.cmp(&a.count)).then_with(|| a.frames.cmp(&b.frames))
    });
    summaries.truncate(limit);
    summaries
}

/// Live bytes per allocation context, largest first
#[must_use]
pub fn context_breakdown(snapshot: &Snapshot) -> Vec<ContextSummary> {
    let total = snapshot.live_bytes();
    let mut by_context: BTreeMap<Option<ContextId>, (usize, u64)> = BTreeMap::new();

    for group in &snapshot.groups {
        for alloc in group.allocations.values() {
            let entry = by_context.entry(alloc.context).or_default();
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(alloc.size);
        }
    }

    let mut summaries: Vec<ContextSummary> = by_context
        .into_iter()
        .map(|(id, (count, bytes))| ContextSummary {
            name: id.and_then(|id| snapshot.context_name(id)).map(str::to_owned),
            count,
            bytes,
            percentage: percentage(bytes, total),
        })
        .collect();
    summaries.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));
    summaries
}

/// Short one-line rendering of a backtrace: at most `depth` frames,
/// innermost first
#[must_use]
pub fn format_frames(frames: &[Frame], depth: usize) -> String {
    let mut out =
        frames.iter().take(depth).map(ToString::to_string).collect::<Vec<_>>().join(" ← ");
    if frames.len() > depth {
        out.push_str(" ← …");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Pid};
    use crate::tracker::AllocationTracker;

    fn sample() -> Snapshot {
        let mut tracker = AllocationTracker::new(Pid(1));
        tracker.on_allocation(Address(0x10), 100, &[Frame(1)], Some("net"));
        tracker.on_allocation(Address(0x20), 100, &[Frame(1)], Some("net"));
        tracker.on_allocation(Address(0x30), 600, &[Frame(2)], None);
        tracker.on_allocation(Address(0x40), 200, &[Frame(3)], Some("db"));
        tracker.snapshot()
    }

    #[test]
    fn test_top_backtraces_ranked_by_bytes() {
        let top = top_backtraces(&sample(), 2);

        assert_eq!(top.len(), 2);
        assert_eq!(&*top[0].frames, &[Frame(2)]);
        assert!((top[0].percentage - 60.0).abs() < 0.001);
        // 200 bytes each; two allocations outrank one
        assert_eq!(&*top[1].frames, &[Frame(1)]);
        assert_eq!(top[1].count, 2);
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(top_backtraces(&Snapshot::empty(Pid(1)), 10).is_empty());
        assert!(context_breakdown(&Snapshot::empty(Pid(1))).is_empty());
    }

    #[test]
    fn test_context_breakdown() {
        let contexts = context_breakdown(&sample());

        assert_eq!(contexts[0].name, None);
        assert_eq!(contexts[0].bytes, 600);
        let net = contexts.iter().find(|c| c.name.as_deref() == Some("net")).unwrap();
        assert_eq!((net.count, net.bytes), (2, 200));
    }

    #[test]
    fn test_huge_sizes_saturate() {
        let half = u64::MAX / 2 + 1;
        let mut tracker = AllocationTracker::new(Pid(1));
        tracker.on_allocation(Address(0x1000), half, &[Frame(1)], Some("big"));
        tracker.on_allocation(Address(0x2000), half, &[Frame(2)], Some("big"));
        let snapshot = tracker.snapshot();

        let top = top_backtraces(&snapshot, 5);
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|s| s.bytes == half));

        let contexts = context_breakdown(&snapshot);
        assert_eq!(contexts[0].bytes, u64::MAX);
        assert!((contexts[0].percentage - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_format_frames_truncates() {
        let frames = [Frame(0x1), Frame(0x2), Frame(0x3)];
        assert_eq!(format_frames(&frames, 2), "0x1 ← 0x2 ← …");
        assert_eq!(format_frames(&frames[..1], 2), "0x1");
    }
}
