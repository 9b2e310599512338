//! The shared operation slot table and per-kind freelists.
//!
//! Slots are allocated once and recycled forever through the freelist of
//! their kind; the generation counter on each slot disambiguates stale
//! references, adapting the generation-checked arena idiom to slots that
//! are shared (`Arc`) because foreign ops and event callbacks hold them
//! concurrently.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::op::{OpKind, OpSlot};
use crate::types::{OpKey, UniqueOpId};

/// Stride between ids handed out by neighboring shards.
const ID_SHARDS: u64 = 8;

/// Sharded allocator for `unique_op_id`.
///
/// Each shard hands out ids congruent to its index modulo the shard
/// count, so allocation never contends on a single cache line.
pub(crate) struct UniqueIdAllocator {
    shards: Vec<AtomicU64>,
}

impl UniqueIdAllocator {
    pub fn new() -> Self {
        // Ids start at 1; 0 marks an inactive slot.
        let shards = (1..=ID_SHARDS).map(AtomicU64::new).collect();
        Self { shards }
    }

    pub fn next(&self, shard_hint: usize) -> UniqueOpId {
        let shard = &self.shards[shard_hint % self.shards.len()];
        shard.fetch_add(ID_SHARDS, Ordering::Relaxed)
    }
}

/// The process-wide operation table.
pub(crate) struct OpTable {
    slots: RwLock<Vec<Arc<OpSlot>>>,
    freelists: [Mutex<Vec<u32>>; OpKind::COUNT],
}

impl OpTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            freelists: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Checks out a slot for `kind`: recycles from the kind's freelist or
    /// grows the table.
    pub fn checkout(&self, kind: OpKind) -> Arc<OpSlot> {
        if let Some(slot) = self.freelists[kind.index()].lock().pop() {
            return self.get_slot(slot).expect("freelist names a live slot");
        }
        let mut slots = self.slots.write();
        let index = u32::try_from(slots.len()).expect("slot table overflow");
        let slot = OpSlot::new(index, kind);
        slots.push(Arc::clone(&slot));
        slot
    }

    /// Returns a slot to its kind's freelist. The caller has already
    /// bumped the generation and reset the state.
    pub fn checkin(&self, slot: &OpSlot) {
        self.freelists[slot.kind.index()].lock().push(slot.slot);
    }

    /// Looks up a slot by index.
    pub fn get_slot(&self, index: u32) -> Option<Arc<OpSlot>> {
        self.slots.read().get(index as usize).cloned()
    }

    /// Looks up the slot a key refers to, without validating the
    /// generation (callers validate under the slot's lock).
    pub fn slot_for(&self, key: OpKey) -> Option<Arc<OpSlot>> {
        self.get_slot(key.slot())
    }

    /// Total slots ever allocated.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }
}
