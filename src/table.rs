//! CID table: radix translation from chunk ids to entry words.
//!
//! The table is a fixed-depth radix trie living inside the heap region: a
//! node-id directory of 2^16 slots on top, then four levels of fanout 2^12
//! covering the 48-bit local id (12 x 4 = 48). Inner slots hold the heap
//! address of the child table block; level-0 (leaf) slots hold chunk entry
//! words. Table blocks are created lazily when the first CID of their
//! subtree is inserted and are never freed.
//!
//! Concurrency contract: leaf words are mutated only through
//! [`CidTable::entry_atomic_update`] (CAS, release) and observed through
//! [`CidTable::translate`] / [`CidTable::entry_reread`] (acquire). Child
//! pointers are published once with a CAS and read with acquire loads.
//! [`CidTable::insert`] writes the leaf word with a plain release store, not
//! a CAS; callers hold the defragmenter gate exclusively or own a reserved
//! slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cid::{ChunkId, LID_MAX};
use crate::entry::{ChunkEntry, RAW_FREE, RAW_RESERVED, RAW_ZOMBIE};
use crate::error::{Error, Result};
use crate::heap::Heap;

/// Slots in the node-id directory (one per 16-bit node id).
const NID_TABLE_SLOTS: usize = 1 << 16;
/// Bits of local id consumed per table level.
const LEVEL_BITS: u32 = 12;
/// Slots per LID-level table.
const LEVEL_SLOTS: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: u64 = LEVEL_SLOTS as u64 - 1;
/// LID levels below the node directory (4 x 12 = 48 bits).
const LID_LEVELS: u32 = 4;

/// Radix table mapping CIDs to chunk entry words.
pub struct CidTable {
    heap: Arc<Heap>,
    node_id: u16,
    /// Heap address of the node-id directory block.
    nid_dir: u64,
    /// Next fresh local id for this node; 0 is reserved as invalid.
    next_lid: AtomicU64,
    /// Local ids reclaimed from zombie slots, re-issued before fresh ones.
    recycled_lids: Mutex<Vec<u64>>,
}

impl CidTable {
    /// Create the table for `node_id`, allocating the node directory in the
    /// heap.
    pub fn new(heap: Arc<Heap>, node_id: u16) -> Result<Self> {
        let nid_dir = heap
            .alloc_table_block(NID_TABLE_SLOTS * 8)
            .ok_or(Error::OutOfMemory)?;

        Ok(Self {
            heap,
            node_id,
            nid_dir,
            next_lid: AtomicU64::new(1),
            recycled_lids: Mutex::new(Vec::new()),
        })
    }

    /// Node id this table issues local ids for.
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    // ========================================================================
    // Translation
    // ========================================================================

    /// Materialize the entry word for `cid`. Returns an invalid entry when
    /// the CID is malformed or no table path exists yet.
    pub fn translate(&self, cid: ChunkId) -> ChunkEntry {
        let mut entry = ChunkEntry::new_free();
        if !cid.is_valid() {
            return entry;
        }
        if let Some(pointer) = self.leaf_slot(cid) {
            let raw = self.heap.atomic_u64(pointer).load(Ordering::Acquire);
            entry.set(pointer, raw);
        }
        entry
    }

    /// Refresh `entry` from its leaf slot (acquire). Pairs with the release
    /// of a successful [`entry_atomic_update`](Self::entry_atomic_update) by
    /// another thread.
    pub fn entry_reread(&self, entry: &mut ChunkEntry) {
        let pointer = entry.pointer();
        let raw = self.heap.atomic_u64(pointer).load(Ordering::Acquire);
        entry.set(pointer, raw);
    }

    /// CAS the entry's recomposed word over the word it was read as. On
    /// success the cached compare value is advanced to the written word; on
    /// failure the caller rereads and retries.
    pub fn entry_atomic_update(&self, entry: &mut ChunkEntry) -> bool {
        let new = entry.encode();
        match self.heap.atomic_u64(entry.pointer()).compare_exchange(
            entry.initial(),
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                entry.set_initial(new);
                true
            }
            Err(_) => false,
        }
    }

    /// CAS a raw sentinel word over the entry's slot (zombie marking).
    pub fn entry_atomic_replace(&self, entry: &ChunkEntry, raw: u64) -> bool {
        self.heap
            .atomic_u64(entry.pointer())
            .compare_exchange(entry.initial(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ========================================================================
    // Insertion and id issuance
    // ========================================================================

    /// Write an entry word into the leaf slot for `cid`, creating missing
    /// table blocks. Not a CAS: the caller must hold the defragmenter gate
    /// exclusively or own the reserved slot.
    pub fn insert(&self, cid: ChunkId, entry: &mut ChunkEntry) -> Result<()> {
        assert!(cid.is_valid(), "inserting invalid cid {cid}");

        let pointer = self.leaf_slot_or_create(cid)?;
        entry.set_pointer(pointer);
        let raw = entry.encode();
        self.heap.atomic_u64(pointer).store(raw, Ordering::Release);
        entry.set_initial(raw);
        Ok(())
    }

    /// Reserve the next local id of this node. Reclaimed zombie ids are
    /// drained before the monotonic counter advances. `None` when the 48-bit
    /// id space is exhausted.
    pub fn reserve_cid(&self) -> Option<ChunkId> {
        if let Some(lid) = self.recycled_lids.lock().pop() {
            return Some(ChunkId::new(self.node_id, lid));
        }
        let lid = self.next_lid.fetch_add(1, Ordering::Relaxed);
        if lid > LID_MAX {
            return None;
        }
        Some(ChunkId::new(self.node_id, lid))
    }

    /// Give a local id back after a failed create (allocation rollback).
    pub(crate) fn recycle_cid(&self, cid: ChunkId) {
        self.recycled_lids.lock().push(cid.lid());
    }

    /// Mark the leaf slot for `cid` as reserved (no memory behind it yet).
    pub fn mark_reserved(&self, cid: ChunkId) -> Result<()> {
        assert!(cid.is_valid());
        let pointer = self.leaf_slot_or_create(cid)?;
        self.heap
            .atomic_u64(pointer)
            .store(RAW_RESERVED, Ordering::Release);
        Ok(())
    }

    /// Roll back a reservation: reset the slot to free and recycle the local
    /// id.
    pub(crate) fn clear_reserved(&self, cid: ChunkId) {
        if let Some(pointer) = self.leaf_slot(cid) {
            let _ = self.heap.atomic_u64(pointer).compare_exchange(
                RAW_RESERVED,
                RAW_FREE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        self.recycled_lids.lock().push(cid.lid());
    }

    /// Whether the leaf slot for `cid` currently holds the reserved marker.
    pub fn is_reserved(&self, cid: ChunkId) -> bool {
        self.leaf_slot(cid)
            .map(|p| self.heap.atomic_u64(p).load(Ordering::Acquire) == RAW_RESERVED)
            .unwrap_or(false)
    }

    // ========================================================================
    // Zombies
    // ========================================================================

    /// Sweep all leaf slots, resetting zombie words to free and queueing
    /// their local ids for re-issuance. Returns the number reclaimed.
    pub fn cleanup_zombies(&self) -> usize {
        let mut reclaimed = Vec::new();

        self.for_each_slot(&mut |cid, pointer, raw| {
            if raw != RAW_ZOMBIE {
                return;
            }
            let ok = self
                .heap
                .atomic_u64(pointer)
                .compare_exchange(RAW_ZOMBIE, RAW_FREE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if ok && cid.nid() == self.node_id {
                reclaimed.push(cid.lid());
            }
        });

        let count = reclaimed.len();
        if count > 0 {
            tracing::trace!(count, "zombie slots reclaimed");
            self.recycled_lids.lock().extend(reclaimed);
        }
        count
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Visit every valid chunk entry. Snapshot semantics are per-slot: each
    /// word is loaded once (acquire) when visited.
    pub fn for_each_valid<F: FnMut(ChunkId, ChunkEntry)>(&self, mut f: F) {
        self.for_each_slot(&mut |cid, pointer, raw| {
            let entry = ChunkEntry::decode(pointer, raw);
            if entry.is_valid() {
                f(cid, entry);
            }
        });
    }

    /// Collect the CIDs of all valid chunks (dump/recovery support).
    pub fn valid_cids(&self) -> Vec<ChunkId> {
        let mut cids = Vec::new();
        self.for_each_valid(|cid, _| cids.push(cid));
        cids
    }

    fn for_each_slot(&self, f: &mut dyn FnMut(ChunkId, u64, u64)) {
        for nid in 0..NID_TABLE_SLOTS as u64 {
            let Some(t3) = self.child(self.nid_dir, nid) else {
                continue;
            };
            for i3 in 0..LEVEL_SLOTS as u64 {
                let Some(t2) = self.child(t3, i3) else {
                    continue;
                };
                for i2 in 0..LEVEL_SLOTS as u64 {
                    let Some(t1) = self.child(t2, i2) else {
                        continue;
                    };
                    for i1 in 0..LEVEL_SLOTS as u64 {
                        let Some(leaf) = self.child(t1, i1) else {
                            continue;
                        };
                        for i0 in 0..LEVEL_SLOTS as u64 {
                            let pointer = leaf + i0 * 8;
                            let raw = self.heap.atomic_u64(pointer).load(Ordering::Acquire);
                            if raw == RAW_FREE {
                                continue;
                            }
                            let lid = i3 << 36 | i2 << 24 | i1 << 12 | i0;
                            f(ChunkId::new(nid as u16, lid), pointer, raw);
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Table walking
    // ========================================================================

    fn leaf_slot(&self, cid: ChunkId) -> Option<u64> {
        let lid = cid.lid();
        let mut table = self.child(self.nid_dir, cid.nid() as u64)?;
        for level in (1..LID_LEVELS).rev() {
            let idx = lid >> (LEVEL_BITS * level) & LEVEL_MASK;
            table = self.child(table, idx)?;
        }
        Some(table + (lid & LEVEL_MASK) * 8)
    }

    fn leaf_slot_or_create(&self, cid: ChunkId) -> Result<u64> {
        let lid = cid.lid();
        let mut table = self.child_or_create(self.nid_dir, cid.nid() as u64)?;
        for level in (1..LID_LEVELS).rev() {
            let idx = lid >> (LEVEL_BITS * level) & LEVEL_MASK;
            table = self.child_or_create(table, idx)?;
        }
        Ok(table + (lid & LEVEL_MASK) * 8)
    }

    #[inline]
    fn child(&self, table: u64, idx: u64) -> Option<u64> {
        let addr = self
            .heap
            .atomic_u64(table + idx * 8)
            .load(Ordering::Acquire);
        (addr != 0).then_some(addr)
    }

    fn child_or_create(&self, table: u64, idx: u64) -> Result<u64> {
        let slot = self.heap.atomic_u64(table + idx * 8);
        let current = slot.load(Ordering::Acquire);
        if current != 0 {
            return Ok(current);
        }

        let block = self
            .heap
            .alloc_table_block(LEVEL_SLOTS * 8)
            .ok_or(Error::OutOfMemory)?;
        match slot.compare_exchange(0, block, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(block),
            // Lost a publication race. The orphaned block stays allocated;
            // create paths hold the exclusive gate so this does not occur in
            // practice.
            Err(existing) => Ok(existing),
        }
    }
}

impl std::fmt::Debug for CidTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CidTable")
            .field("node_id", &self.node_id)
            .field("next_lid", &self.next_lid.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
