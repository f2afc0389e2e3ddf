//! Defragmenter coordination and heap compaction.
//!
//! Application operations and the compactor are separated by a two-mode
//! gate: operations hold it shared, the compactor (and the create-family
//! operations, whose table inserts are not CAS-based) hold it exclusively.
//! The underlying `parking_lot::RwLock` queues fairly, so a waiting
//! exclusive acquirer blocks new shared acquirers and a long run of
//! application traffic cannot starve compaction.
//!
//! A compaction pass walks the CID table, write-locks one non-pinned chunk
//! at a time, re-allocates its block, copies the overflow prefix and payload
//! to the new location, publishes the new address through the entry CAS and
//! frees the old block. A chunk is only moved when the allocator can place
//! it at a lower address, so every pass makes monotonic progress toward a
//! packed heap. Pinned chunks are never touched.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entry::ChunkEntry;
use crate::heap::Heap;
use crate::lock::{self, LockStatus, LockTimeout};
use crate::table::CidTable;

/// Two-mode gate separating application threads from the compactor.
pub struct DefragGate {
    lock: RwLock<()>,
}

impl DefragGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    /// Enter application mode (shared). Many operations hold this at once.
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Enter defragmenter mode (exclusive). Blocks until all shared holders
    /// drain; new shared acquirers queue behind this request.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }
}

impl Default for DefragGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Valid chunks visited.
    pub visited: u64,
    /// Chunks relocated to a lower address.
    pub moved_chunks: u64,
    /// Payload bytes copied.
    pub moved_bytes: u64,
    /// Chunks left in place because they are pinned.
    pub skipped_pinned: u64,
}

/// Run one compaction pass under the exclusive gate.
pub(crate) fn compact(heap: &Heap, table: &CidTable, gate: &DefragGate) -> CompactionSummary {
    let _exclusive = gate.exclusive();

    let mut summary = CompactionSummary::default();

    let cids = table.valid_cids();
    for cid in cids {
        let mut entry = table.translate(cid);
        if !entry.is_valid() {
            continue;
        }
        summary.visited += 1;

        if entry.is_pinned() {
            summary.skipped_pinned += 1;
            continue;
        }

        // No application thread can hold a chunk lock while we hold the gate
        // exclusively, but the one-shot acquire keeps this pass safe even if
        // that ever changes.
        if lock::acquire_write_lock(table, &mut entry, LockTimeout::TryOnce) != LockStatus::Ok {
            continue;
        }

        let size = heap.payload_size(&entry);

        let mut candidate = ChunkEntry::new_free();
        if heap.malloc(&mut candidate, size).is_err() {
            lock::release_write_lock(table, &mut entry);
            continue;
        }

        if candidate.address() < entry.address() {
            heap.move_payload(entry.address(), candidate.address(), size);

            let old = entry;
            entry.set_address(candidate.address());
            while !table.entry_atomic_update(&mut entry) {
                table.entry_reread(&mut entry);
                entry.set_address(candidate.address());
            }
            heap.free(&old);

            summary.moved_chunks += 1;
            summary.moved_bytes += size as u64;
        } else {
            // The allocator could not improve on the current placement.
            heap.free(&candidate);
        }

        lock::release_write_lock(table, &mut entry);
    }

    tracing::debug!(
        visited = summary.visited,
        moved_chunks = summary.moved_chunks,
        moved_bytes = summary.moved_bytes,
        skipped_pinned = summary.skipped_pinned,
        "compaction pass finished"
    );
    summary
}
