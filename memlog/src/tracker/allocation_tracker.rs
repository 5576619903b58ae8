//! # Allocation Tracking
//!
//! Authoritative live-allocation state for one monitored process.
//!
//! The tracker is an eventually-consistent observer of another process's
//! allocator, not the allocator itself. Two relaxed rules follow:
//!
//! - An ALLOC for an address that is already live replaces the old record
//!   (the free may simply not have been observed yet).
//! - A FREE for an unknown address is ignored (the allocation may predate
//!   the connection).
//!
//! ## Barriers
//!
//! Snapshot requests are fenced by barrier ids. A callback registered with
//! [`AllocationTracker::snapshot_on_barrier`] fires when the stream reaches
//! the matching [`AllocationTracker::on_barrier`]. Everything runs on the one
//! worker thread that owns the tracker, so "reached" means every earlier
//! record has been applied and no later one has.
//!
//! ```text
//! stream:   A1  A2  BARRIER(7)  A3
//!                       │
//!                       └──▶ callbacks for #7 see {A1, A2}
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::debug;

use super::backtrace_storage::{BacktraceHandle, BacktraceStorage, InternedBacktraces};
use super::snapshot::{BacktraceGroup, Snapshot, SnapshotAllocation};
use super::{DumpResult, SnapshotCallback};
use crate::domain::{Address, BarrierId, ContextId, DumpError, Frame, Pid};
use crate::protocol::{Record, RecordSink};

/// Barrier ids reached without a registered callback that are remembered,
/// oldest first, so a late registration still fires
const REACHED_BARRIER_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy)]
struct LiveAllocation {
    size: u64,
    backtrace: BacktraceHandle,
    context: Option<ContextId>,
}

/// Interned context name with the number of live allocations using it
#[derive(Debug)]
struct ContextSlot {
    name: String,
    refs: usize,
}

/// Counters describing everything a tracker has applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub allocations: u64,
    pub frees: u64,
    /// Frees of addresses that were not live
    pub unmatched_frees: u64,
    /// Allocations that replaced a live record at the same address
    pub overwrites: u64,
    pub barriers: u64,
    pub live_count: usize,
    pub live_bytes: u64,
}

/// Per-process live allocation map keyed by address
pub struct AllocationTracker<S: BacktraceStorage = InternedBacktraces> {
    pid: Pid,
    storage: S,
    live: HashMap<Address, LiveAllocation>,

    context_ids: HashMap<String, ContextId>,
    contexts: Vec<ContextSlot>,
    free_contexts: Vec<ContextId>,

    pending_barriers: HashMap<BarrierId, Vec<SnapshotCallback>>,
    reached_barriers: VecDeque<BarrierId>,
    completion: Option<SnapshotCallback>,

    stream_closed: bool,
    failure: Option<String>,
    stats: TrackerStats,
}

impl AllocationTracker<InternedBacktraces> {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self::with_storage(pid, InternedBacktraces::new())
    }
}

impl<S: BacktraceStorage> AllocationTracker<S> {
    /// Create a tracker that interns backtraces through `storage`
    pub fn with_storage(pid: Pid, storage: S) -> Self {
        Self {
            pid,
            storage,
            live: HashMap::new(),
            context_ids: HashMap::new(),
            contexts: Vec::new(),
            free_contexts: Vec::new(),
            pending_barriers: HashMap::new(),
            reached_barriers: VecDeque::new(),
            completion: None,
            stream_closed: false,
            failure: None,
            stats: TrackerStats::default(),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Reason tracking stopped, if it did
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Context names currently referenced by a live allocation
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.context_ids.len()
    }

    /// Record a live allocation, replacing any record already at `address`
    pub fn on_allocation(
        &mut self,
        address: Address,
        size: u64,
        frames: &[Frame],
        context: Option<&str>,
    ) {
        let backtrace = self.storage.intern(frames);
        let context = context.map(|name| self.intern_context(name));

        self.stats.allocations += 1;
        self.stats.live_bytes = self.stats.live_bytes.saturating_add(size);

        if let Some(old) = self.live.insert(address, LiveAllocation { size, backtrace, context }) {
            self.stats.overwrites += 1;
            self.stats.live_bytes = self.stats.live_bytes.saturating_sub(old.size);
            self.release(old);
        }
        self.stats.live_count = self.live.len();
    }

    /// Forget the allocation at `address`; unknown addresses are ignored
    pub fn on_free(&mut self, address: Address) {
        self.stats.frees += 1;

        match self.live.remove(&address) {
            Some(old) => {
                self.stats.live_bytes = self.stats.live_bytes.saturating_sub(old.size);
                self.stats.live_count = self.live.len();
                self.release(old);
            }
            None => self.stats.unmatched_frees += 1,
        }
    }

    /// The stream reached `id`: fire every callback waiting for it
    pub fn on_barrier(&mut self, id: BarrierId) {
        self.stats.barriers += 1;

        match self.pending_barriers.remove(&id) {
            Some(callbacks) => {
                debug!("{}: {id} reached, {} snapshot(s) waiting", self.pid, callbacks.len());
                for callback in callbacks {
                    callback(self.result_at(Some(id)));
                }
            }
            None => {
                if self.reached_barriers.len() == REACHED_BARRIER_HISTORY {
                    self.reached_barriers.pop_front();
                }
                self.reached_barriers.push_back(id);
            }
        }
    }

    /// Deliver a snapshot to `callback` when the stream reaches barrier `id`.
    ///
    /// Fires immediately if `id` was already reached and not yet claimed, or
    /// with an error if tracking failed or the stream already ended.
    pub fn snapshot_on_barrier(&mut self, id: BarrierId, callback: SnapshotCallback) {
        if let Some(reason) = &self.failure {
            callback(Err(DumpError::TrackingFailed { pid: self.pid, reason: reason.clone() }));
            return;
        }

        if let Some(pos) = self.reached_barriers.iter().position(|&reached| reached == id) {
            self.reached_barriers.remove(pos);
            callback(self.result_at(Some(id)));
            return;
        }

        if self.stream_closed {
            callback(Err(DumpError::BarrierNotReached { pid: self.pid, barrier: id }));
            return;
        }

        self.pending_barriers.entry(id).or_default().push(callback);
    }

    /// Barrier `id` at the current stream position: `callback` sees every
    /// record applied so far and nothing after.
    pub fn fence(&mut self, id: BarrierId, callback: SnapshotCallback) {
        self.stats.barriers += 1;
        callback(self.result_at(Some(id)));
    }

    /// Copy out the current state
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_at(None)
    }

    /// Deliver the final snapshot once the stream has ended.
    ///
    /// Fires immediately if it already has.
    pub fn complete(&mut self, callback: SnapshotCallback) {
        if self.stream_closed {
            callback(self.result_at(None));
        } else {
            self.completion = Some(callback);
        }
    }

    /// Stop tracking: every pending and future snapshot fails with `reason`
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
        self.fail_pending_barriers();
    }

    /// End of stream: the final implicit barrier
    ///
    /// Barriers that were requested but never reached fail so that no caller
    /// waits forever, then the completion callback receives the final state.
    pub fn on_stream_closed(&mut self) {
        if self.stream_closed {
            return;
        }
        self.stream_closed = true;
        self.fail_pending_barriers();

        if let Some(callback) = self.completion.take() {
            callback(self.result_at(None));
        }
    }

    fn fail_pending_barriers(&mut self) {
        for (id, callbacks) in self.pending_barriers.drain() {
            for callback in callbacks {
                let error = match &self.failure {
                    Some(reason) => {
                        DumpError::TrackingFailed { pid: self.pid, reason: reason.clone() }
                    }
                    None => DumpError::BarrierNotReached { pid: self.pid, barrier: id },
                };
                callback(Err(error));
            }
        }
    }

    fn result_at(&self, barrier: Option<BarrierId>) -> DumpResult {
        match &self.failure {
            Some(reason) => {
                Err(DumpError::TrackingFailed { pid: self.pid, reason: reason.clone() })
            }
            None => Ok(self.snapshot_at(barrier)),
        }
    }

    fn snapshot_at(&self, barrier: Option<BarrierId>) -> Snapshot {
        let mut by_backtrace: HashMap<BacktraceHandle, BTreeMap<Address, SnapshotAllocation>> =
            HashMap::new();
        let mut contexts = BTreeMap::new();

        for (&address, live) in &self.live {
            by_backtrace
                .entry(live.backtrace)
                .or_default()
                .insert(address, SnapshotAllocation { size: live.size, context: live.context });

            if let Some(id) = live.context {
                contexts
                    .entry(id)
                    .or_insert_with(|| self.contexts[id.0 as usize].name.clone());
            }
        }

        let mut groups: Vec<BacktraceGroup> = by_backtrace
            .into_iter()
            .filter_map(|(handle, allocations)| {
                self.storage.frames(handle).map(|frames| BacktraceGroup { frames, allocations })
            })
            .collect();
        groups.sort_by(|a, b| a.frames.cmp(&b.frames));

        Snapshot { pid: self.pid, barrier, groups, contexts }
    }

    fn intern_context(&mut self, name: &str) -> ContextId {
        if let Some(&id) = self.context_ids.get(name) {
            self.contexts[id.0 as usize].refs += 1;
            return id;
        }

        let slot = ContextSlot { name: name.to_owned(), refs: 1 };
        let id = match self.free_contexts.pop() {
            Some(id) => {
                self.contexts[id.0 as usize] = slot;
                id
            }
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let id = ContextId(self.contexts.len() as u32);
                self.contexts.push(slot);
                id
            }
        };
        self.context_ids.insert(name.to_owned(), id);
        id
    }

    fn release(&mut self, old: LiveAllocation) {
        self.storage.release(old.backtrace);

        let Some(id) = old.context else { return };
        let slot = &mut self.contexts[id.0 as usize];
        slot.refs -= 1;
        if slot.refs == 0 {
            let name = std::mem::take(&mut slot.name);
            self.context_ids.remove(&name);
            self.free_contexts.push(id);
        }
    }
}

impl<S: BacktraceStorage> RecordSink for AllocationTracker<S> {
    fn on_record(&mut self, record: Record) {
        match record {
            Record::Alloc(alloc) => {
                let context = alloc.context.as_deref();
                self.on_allocation(alloc.address, alloc.size, &alloc.frames, context);
            }
            Record::Free { address } => self.on_free(address),
            Record::Barrier { id } => self.on_barrier(id),
        }
    }
}
