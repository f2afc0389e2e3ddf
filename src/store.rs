//! The chunk store: top-level operation layer.
//!
//! Every operation follows the same sequence: enter the defragmenter gate
//! (shared for data-path operations, exclusive for the create family, whose
//! table inserts are not CAS-based), translate the CID to a materialized
//! entry, take the per-chunk lock appropriate for the operation, perform the
//! heap I/O, and release lock and gate. Only one chunk is ever locked per
//! operation, so there is no lock ordering to get wrong.
//!
//! Operation counters are recorded at the operation boundary through the
//! injected [`OpCounters`] interface; the store works identically with the
//! no-op default.

use std::sync::Arc;

use crate::cid::ChunkId;
use crate::config::StoreConfig;
use crate::defrag::{self, CompactionSummary, DefragGate};
use crate::entry::{ChunkEntry, CHUNK_SIZE_MAX, RAW_ZOMBIE};
use crate::error::{Error, Result};
use crate::heap::{Heap, HeapStatus};
use crate::imexport::HeapImExporter;
use crate::lock::{self, LockStatus, LockTimeout};
use crate::stats::{NoopCounters, Op, OpCounters};
use crate::table::CidTable;

/// Embeddable off-heap chunk store.
///
/// Maps 64-bit chunk ids to variable-sized byte chunks in a pre-reserved
/// memory region. All operations are safe to call from many threads
/// concurrently; a background thread may run [`defragment`](Self::defragment)
/// at any time.
pub struct ChunkStore {
    heap: Arc<Heap>,
    table: CidTable,
    gate: DefragGate,
    counters: Arc<dyn OpCounters>,
}

impl ChunkStore {
    /// Create a store with the given configuration and no counters.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_counters(config, Arc::new(NoopCounters))
    }

    /// Create a store recording operation events into `counters`.
    pub fn with_counters(config: StoreConfig, counters: Arc<dyn OpCounters>) -> Result<Self> {
        let heap = Arc::new(Heap::new(config.heap_capacity())?);
        let table = CidTable::new(Arc::clone(&heap), config.node_id())?;

        tracing::debug!(
            heap_capacity = config.heap_capacity(),
            node_id = config.node_id(),
            "chunk store initialized"
        );

        Ok(Self {
            heap,
            table,
            gate: DefragGate::new(),
            counters,
        })
    }

    /// Node id stamped into CIDs issued by this store.
    pub fn node_id(&self) -> u16 {
        self.table.node_id()
    }

    /// The injected operation-counter sink.
    pub fn counters(&self) -> &Arc<dyn OpCounters> {
        &self.counters
    }

    /// Allocator counters of the underlying heap.
    pub fn heap_status(&self) -> HeapStatus {
        self.heap.status()
    }

    /// The underlying heap, for cursor-based serialization on addresses
    /// obtained from [`create_with_address`](Self::create_with_address) or
    /// [`create_reserved`](Self::create_reserved).
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Position an import/export cursor on a raw payload address. The caller
    /// is responsible for holding the chunk's lock while the cursor is used.
    pub fn im_exporter(&self, address: u64) -> HeapImExporter<'_> {
        HeapImExporter::new(&self.heap, address)
    }

    // ========================================================================
    // Create family (exclusive gate)
    // ========================================================================

    /// Create a chunk of `size` bytes and return its CID.
    pub fn create(&self, size: usize) -> Result<ChunkId> {
        self.create_with_address(size).map(|(cid, _)| cid)
    }

    /// Create a chunk and additionally return the raw payload address.
    pub fn create_with_address(&self, size: usize) -> Result<(ChunkId, u64)> {
        self.counters.record(Op::Create);
        if size == 0 || size > CHUNK_SIZE_MAX {
            return Err(Error::SizeOutOfRange(size));
        }

        let _gate = self.gate.exclusive();

        let cid = self.table.reserve_cid().ok_or(Error::OutOfMemory)?;
        let mut entry = ChunkEntry::new_free();
        if let Err(err) = self.heap.malloc(&mut entry, size) {
            self.table.recycle_cid(cid);
            return Err(err);
        }
        if let Err(err) = self.table.insert(cid, &mut entry) {
            self.heap.free(&entry);
            self.table.recycle_cid(cid);
            return Err(err);
        }
        Ok((cid, entry.address()))
    }

    /// Reserve `count` CIDs without backing memory. The returned ids must be
    /// materialized with [`create_reserved`](Self::create_reserved) before
    /// any other operation accepts them.
    pub fn reserve(&self, count: usize) -> Result<Vec<ChunkId>> {
        self.counters.record(Op::Reserve);

        let _gate = self.gate.exclusive();

        let mut cids = Vec::with_capacity(count);
        for _ in 0..count {
            let cid = match self.table.reserve_cid() {
                Some(cid) => cid,
                None => {
                    for &done in &cids {
                        self.table.clear_reserved(done);
                    }
                    return Err(Error::OutOfMemory);
                }
            };
            if let Err(err) = self.table.mark_reserved(cid) {
                self.table.recycle_cid(cid);
                for &done in &cids {
                    self.table.clear_reserved(done);
                }
                return Err(err);
            }
            cids.push(cid);
        }
        Ok(cids)
    }

    /// Allocate memory for previously reserved CIDs, all-or-nothing.
    ///
    /// `out_addresses`, when given, receives the raw payload address of each
    /// chunk. Passing CIDs that were not obtained from
    /// [`reserve`](Self::reserve) corrupts the table; this is a programmer
    /// error checked by debug assertions only.
    pub fn create_reserved(
        &self,
        cids: &[ChunkId],
        sizes: &[usize],
        mut out_addresses: Option<&mut [u64]>,
    ) -> Result<()> {
        self.counters.record(Op::CreateReserved);
        assert_eq!(cids.len(), sizes.len());
        if let Some(out) = out_addresses.as_deref() {
            assert_eq!(out.len(), cids.len());
        }

        let _gate = self.gate.exclusive();

        let mut entries = vec![ChunkEntry::new_free(); cids.len()];
        self.heap.malloc_batch(&mut entries, sizes)?;

        for (i, &cid) in cids.iter().enumerate() {
            debug_assert!(
                self.table.is_reserved(cid),
                "create_reserved with non-reserved cid {cid}"
            );
            // The table path exists since reservation, so this cannot
            // allocate and cannot fail.
            self.table.insert(cid, &mut entries[i])?;
        }

        if let Some(out) = out_addresses.as_deref_mut() {
            for (slot, entry) in out.iter_mut().zip(&entries) {
                *slot = entry.address();
            }
        }
        Ok(())
    }

    // ========================================================================
    // Data path (shared gate)
    // ========================================================================

    /// Copy the chunk's payload into `buf`, returning the count copied
    /// (`min(buf.len(), chunk size)`).
    ///
    /// The read lock admits up to 127 concurrent readers; when the counter
    /// is saturated the acquisition retries within its timeout instead of
    /// failing.
    pub fn get(&self, cid: ChunkId, buf: &mut [u8], timeout: LockTimeout) -> Result<usize> {
        self.counters.record(Op::Get);
        Self::check_cid(cid)?;

        let _gate = self.gate.shared();
        let mut entry = self.table.translate(cid);

        match lock::acquire_read_lock(&self.table, &mut entry, timeout) {
            LockStatus::Invalid => Err(Error::DoesNotExist),
            LockStatus::Timeout => Err(Error::LockTimeout),
            LockStatus::Ok => {
                let size = self.heap.payload_size(&entry);
                let n = buf.len().min(size);
                let copied = self.heap.read_bytes(entry.address(), 0, &mut buf[..n]);
                lock::release_read_lock(&self.table, &mut entry);
                copied.ok_or(Error::IncompleteIo)
            }
        }
    }

    /// Copy `buf` into the chunk's payload, returning the count copied
    /// (`min(buf.len(), chunk size)`).
    pub fn put(&self, cid: ChunkId, buf: &[u8], timeout: LockTimeout) -> Result<usize> {
        self.counters.record(Op::Put);
        Self::check_cid(cid)?;

        let _gate = self.gate.shared();
        let mut entry = self.table.translate(cid);

        match lock::acquire_write_lock(&self.table, &mut entry, timeout) {
            LockStatus::Invalid => Err(Error::DoesNotExist),
            LockStatus::Timeout => Err(Error::LockTimeout),
            LockStatus::Ok => {
                let size = self.heap.payload_size(&entry);
                let n = buf.len().min(size);
                let copied = self.heap.write_bytes(entry.address(), 0, &buf[..n]);
                lock::release_write_lock(&self.table, &mut entry);
                copied.ok_or(Error::IncompleteIo)
            }
        }
    }

    /// Resize the chunk to `new_size` bytes, preserving
    /// `min(old, new)` payload bytes. The payload address may change.
    pub fn resize(&self, cid: ChunkId, new_size: usize, timeout: LockTimeout) -> Result<()> {
        self.counters.record(Op::Resize);
        Self::check_cid(cid)?;
        if new_size == 0 || new_size > CHUNK_SIZE_MAX {
            return Err(Error::SizeOutOfRange(new_size));
        }

        let _gate = self.gate.shared();
        let mut entry = self.table.translate(cid);

        match lock::acquire_write_lock(&self.table, &mut entry, timeout) {
            LockStatus::Invalid => Err(Error::DoesNotExist),
            LockStatus::Timeout => Err(Error::LockTimeout),
            LockStatus::Ok => {
                let resized = self.heap.resize(&mut entry, new_size);
                if resized.is_ok() {
                    // Publish new address/length; cannot race while the
                    // write lock is held.
                    let updated = self.table.entry_atomic_update(&mut entry);
                    debug_assert!(updated);
                }
                lock::release_write_lock(&self.table, &mut entry);
                resized.map(|_| ())
            }
        }
    }

    /// Remove the chunk, freeing its memory. The slot becomes a zombie so
    /// the CID is not re-issued until [`cleanup_zombies`](Self::cleanup_zombies).
    /// Returns the size of the removed payload.
    pub fn remove(&self, cid: ChunkId, timeout: LockTimeout) -> Result<usize> {
        self.counters.record(Op::Remove);
        Self::check_cid(cid)?;

        let _gate = self.gate.shared();
        let mut entry = self.table.translate(cid);

        match lock::acquire_write_lock(&self.table, &mut entry, timeout) {
            LockStatus::Invalid => Err(Error::DoesNotExist),
            LockStatus::Timeout => Err(Error::LockTimeout),
            LockStatus::Ok => {
                let size = self.heap.payload_size(&entry);
                self.heap.free(&entry);
                // Final transition; the write lock bit disappears with it.
                while !self.table.entry_atomic_replace(&entry, RAW_ZOMBIE) {
                    self.table.entry_reread(&mut entry);
                }
                Ok(size)
            }
        }
    }

    /// Pin the chunk: the defragmenter leaves its address untouched.
    pub fn pin(&self, cid: ChunkId, timeout: LockTimeout) -> Result<()> {
        self.counters.record(Op::Pin);
        self.set_pin_flag(cid, true, timeout)
    }

    /// Clear the chunk's pin flag.
    pub fn unpin(&self, cid: ChunkId, timeout: LockTimeout) -> Result<()> {
        self.counters.record(Op::Unpin);
        self.set_pin_flag(cid, false, timeout)
    }

    fn set_pin_flag(&self, cid: ChunkId, pinned: bool, timeout: LockTimeout) -> Result<()> {
        Self::check_cid(cid)?;

        let _gate = self.gate.shared();
        let mut entry = self.table.translate(cid);

        match lock::acquire_write_lock(&self.table, &mut entry, timeout) {
            LockStatus::Invalid => Err(Error::DoesNotExist),
            LockStatus::Timeout => Err(Error::LockTimeout),
            LockStatus::Ok => {
                entry.set_pinned(pinned);
                let updated = self.table.entry_atomic_update(&mut entry);
                debug_assert!(updated);
                lock::release_write_lock(&self.table, &mut entry);
                Ok(())
            }
        }
    }

    /// Whether `cid` currently addresses a live chunk.
    pub fn exists(&self, cid: ChunkId) -> bool {
        let _gate = self.gate.shared();
        self.table.translate(cid).is_valid()
    }

    /// Payload size of the chunk in bytes.
    pub fn size(&self, cid: ChunkId, timeout: LockTimeout) -> Result<usize> {
        Self::check_cid(cid)?;

        let _gate = self.gate.shared();
        let mut entry = self.table.translate(cid);

        match lock::acquire_read_lock(&self.table, &mut entry, timeout) {
            LockStatus::Invalid => Err(Error::DoesNotExist),
            LockStatus::Timeout => Err(Error::LockTimeout),
            LockStatus::Ok => {
                let size = self.heap.payload_size(&entry);
                lock::release_read_lock(&self.table, &mut entry);
                Ok(size)
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one heap compaction pass. Application operations queue behind it;
    /// pinned chunks keep their addresses.
    pub fn defragment(&self) -> CompactionSummary {
        defrag::compact(&self.heap, &self.table, &self.gate)
    }

    /// Reclaim zombie slots, making their CIDs eligible for re-issuance.
    /// Returns the number reclaimed.
    pub fn cleanup_zombies(&self) -> usize {
        let _gate = self.gate.exclusive();
        self.table.cleanup_zombies()
    }

    /// Visit every live chunk (dump/recovery support). Runs under the
    /// exclusive gate, so the view is consistent.
    pub fn for_each_chunk<F: FnMut(ChunkId, &ChunkEntry, usize)>(&self, mut f: F) {
        let _gate = self.gate.exclusive();
        self.table.for_each_valid(|cid, entry| {
            let size = self.heap.payload_size(&entry);
            f(cid, &entry, size);
        });
    }

    #[inline]
    fn check_cid(cid: ChunkId) -> Result<()> {
        if cid.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidId)
        }
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("node_id", &self.node_id())
            .field("heap", &self.heap_status())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
