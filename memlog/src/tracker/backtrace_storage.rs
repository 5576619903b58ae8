//! Backtrace interning
//!
//! The tracker never stores frame lists itself. It asks a [`BacktraceStorage`]
//! for a handle and gives the handle back when the allocation that used it
//! goes away. The storage owns deduplication and lifetime: one reference per
//! live allocation, freed when the count reaches zero.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::Frame;

/// Opaque reference to an interned backtrace
///
/// The generation makes a handle to a recycled slot detectably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BacktraceHandle {
    index: u32,
    generation: u32,
}

/// Key-interning service for backtraces, confined to one worker thread
pub trait BacktraceStorage {
    /// Acquire a reference to `frames`, interning them on first sight
    fn intern(&mut self, frames: &[Frame]) -> BacktraceHandle;

    /// Drop one reference previously returned by [`intern`](Self::intern)
    fn release(&mut self, handle: BacktraceHandle);

    /// Frames behind a live handle
    fn frames(&self, handle: BacktraceHandle) -> Option<Arc<[Frame]>>;

    /// Number of distinct backtraces currently referenced
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Slot {
    frames: Option<Arc<[Frame]>>,
    refs: u32,
    generation: u32,
}

/// Reference-counted slot arena with a free list
#[derive(Debug, Default)]
pub struct InternedBacktraces {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    index: HashMap<Arc<[Frame]>, u32>,
}

impl InternedBacktraces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference count of a live handle (0 if stale)
    #[must_use]
    pub fn ref_count(&self, handle: BacktraceHandle) -> u32 {
        self.live_slot(handle).map_or(0, |slot| slot.refs)
    }

    fn live_slot(&self, handle: BacktraceHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.frames.is_some())
    }
}

impl BacktraceStorage for InternedBacktraces {
    fn intern(&mut self, frames: &[Frame]) -> BacktraceHandle {
        if let Some(&index) = self.index.get(frames) {
            let slot = &mut self.slots[index as usize];
            slot.refs += 1;
            return BacktraceHandle { index, generation: slot.generation };
        }

        let frames: Arc<[Frame]> = Arc::from(frames);
        let index = if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.frames = Some(Arc::clone(&frames));
            slot.refs = 1;
            index
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let index = self.slots.len() as u32;
            self.slots.push(Slot { frames: Some(Arc::clone(&frames)), refs: 1, generation: 0 });
            index
        };

        self.index.insert(frames, index);
        BacktraceHandle { index, generation: self.slots[index as usize].generation }
    }

    fn release(&mut self, handle: BacktraceHandle) {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation || slot.refs == 0 {
            return;
        }

        slot.refs -= 1;
        if slot.refs == 0 {
            if let Some(frames) = slot.frames.take() {
                self.index.remove(&frames);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free_slots.push(handle.index);
        }
    }

    fn frames(&self, handle: BacktraceHandle) -> Option<Arc<[Frame]>> {
        self.live_slot(handle).and_then(|slot| slot.frames.clone())
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
