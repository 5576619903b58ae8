//! Point-in-time heap snapshots
//!
//! A [`Snapshot`] is a copy-out of tracker state: it owns everything it
//! references (frames are shared `Arc`s, immutable once interned), so it can
//! cross threads and outlive the connection that produced it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{Address, BarrierId, ContextId, Frame, Pid};

/// One live allocation inside a [`BacktraceGroup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotAllocation {
    pub size: u64,
    pub context: Option<ContextId>,
}

/// All live allocations that share one backtrace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceGroup {
    pub frames: Arc<[Frame]>,
    pub allocations: BTreeMap<Address, SnapshotAllocation>,
}

impl BacktraceGroup {
    #[must_use]
    pub fn count(&self) -> usize {
        self.allocations.len()
    }

    /// Sum of sizes, saturating at `u64::MAX`
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.allocations.values().map(|a| a.size).fold(0, u64::saturating_add)
    }
}

/// Borrowed view of one allocation with its backtrace and context resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationView<'a> {
    pub address: Address,
    pub size: u64,
    pub frames: &'a [Frame],
    pub context: Option<&'a str>,
}

/// Live heap of one process at one point of its event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub pid: Pid,
    /// Barrier the snapshot was taken at (`None` for direct and final snapshots)
    pub barrier: Option<BarrierId>,
    /// Groups ordered by frames, so equal heaps compare equal
    pub groups: Vec<BacktraceGroup>,
    /// Names of every context referenced by `groups`
    pub contexts: BTreeMap<ContextId, String>,
}

impl Snapshot {
    /// Empty snapshot for `pid`
    #[must_use]
    pub fn empty(pid: Pid) -> Self {
        Self { pid, barrier: None, groups: Vec::new(), contexts: BTreeMap::new() }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.groups.iter().map(BacktraceGroup::count).sum()
    }

    /// Sum of live sizes, saturating at `u64::MAX`
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.groups.iter().map(BacktraceGroup::total_bytes).fold(0, u64::saturating_add)
    }

    /// Look up a single live allocation
    #[must_use]
    pub fn find(&self, address: Address) -> Option<AllocationView<'_>> {
        self.groups.iter().find_map(|group| {
            group.allocations.get(&address).map(|alloc| self.view(group, address, alloc))
        })
    }

    /// Every live allocation, grouped by backtrace
    pub fn allocations(&self) -> impl Iterator<Item = AllocationView<'_>> + '_ {
        self.groups.iter().flat_map(move |group| {
            group.allocations.iter().map(move |(&address, alloc)| self.view(group, address, alloc))
        })
    }

    #[must_use]
    pub fn context_name(&self, id: ContextId) -> Option<&str> {
        self.contexts.get(&id).map(String::as_str)
    }

    /// True if both snapshots describe the same heap, ignoring which barrier
    /// produced them
    #[must_use]
    pub fn same_heap(&self, other: &Snapshot) -> bool {
        self.pid == other.pid && self.groups == other.groups && self.contexts == other.contexts
    }

    fn view<'a>(
        &'a self,
        group: &'a BacktraceGroup,
        address: Address,
        alloc: &SnapshotAllocation,
    ) -> AllocationView<'a> {
        AllocationView {
            address,
            size: alloc.size,
            frames: &group.frames,
            context: alloc.context.and_then(|id| self.context_name(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(frames: &[u64], allocs: &[(u64, u64, Option<u32>)]) -> BacktraceGroup {
        BacktraceGroup {
            frames: frames.iter().copied().map(Frame).collect::<Vec<_>>().into(),
            allocations: allocs
                .iter()
                .map(|&(addr, size, ctx)| {
                    (Address(addr), SnapshotAllocation { size, context: ctx.map(ContextId) })
                })
                .collect(),
        }
    }

    #[test]
    fn test_totals() {
        let mut snapshot = Snapshot::empty(Pid(1));
        snapshot.groups.push(group(&[1], &[(0x10, 8, None), (0x20, 24, None)]));
        snapshot.groups.push(group(&[1, 2], &[(0x30, 100, None)]));

        assert_eq!(snapshot.live_count(), 3);
        assert_eq!(snapshot.live_bytes(), 132);
        assert_eq!(snapshot.groups[0].total_bytes(), 32);
    }

    #[test]
    fn test_totals_saturate() {
        let half = u64::MAX / 2 + 1;
        let mut snapshot = Snapshot::empty(Pid(1));
        snapshot.groups.push(group(&[1], &[(0x1000, half, None), (0x2000, half, None)]));
        snapshot.groups.push(group(&[2], &[(0x3000, 1, None)]));

        assert_eq!(snapshot.groups[0].total_bytes(), u64::MAX);
        assert_eq!(snapshot.live_bytes(), u64::MAX);
    }

    #[test]
    fn test_find_resolves_context() {
        let mut snapshot = Snapshot::empty(Pid(1));
        snapshot.groups.push(group(&[0xf1], &[(0x2000, 32, Some(0))]));
        snapshot.contexts.insert(ContextId(0), "net".to_string());

        let view = snapshot.find(Address(0x2000)).unwrap();
        assert_eq!(view.size, 32);
        assert_eq!(view.frames, &[Frame(0xf1)]);
        assert_eq!(view.context, Some("net"));
        assert!(snapshot.find(Address(0x1000)).is_none());
    }

    #[test]
    fn test_same_heap_ignores_barrier() {
        let mut a = Snapshot::empty(Pid(3));
        a.groups.push(group(&[1], &[(0x10, 8, None)]));
        let mut b = a.clone();
        a.barrier = Some(BarrierId(1));
        b.barrier = Some(BarrierId(2));

        assert_ne!(a, b);
        assert!(a.same_heap(&b));
    }
}
