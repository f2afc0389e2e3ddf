//! Off-heap memory region and chunk allocator.
//!
//! ## Design
//!
//! One contiguous region is reserved at init time (`mmap` on Unix) and never
//! moves or grows. Chunk payloads, overflow length prefixes and CID table
//! blocks all live inside it; every value handed out by this module is a byte
//! offset into the region, never a host pointer.
//!
//! Allocation is a segregated-fit free list keyed by power-of-two size class
//! with boundary tags:
//!
//! ```text
//! allocated block:  | header 8B | prefix 0-3B | payload ... | pad to 8B |
//! free block:       | header 8B | next 8B | prev 8B | ... | footer 8B |
//! ```
//!
//! The header carries the block size plus a free flag and a prev-free flag,
//! so freeing coalesces with both neighbors in O(1). Free blocks are never
//! adjacent. The entry word stores the payload address; the allocator
//! recovers the block start from the entry's prefix size.
//!
//! Free-list state is serialized by a mutex; typed reads and writes on
//! payloads are raw and unsynchronized, relying on the per-chunk lock held
//! by the caller.

use std::ptr;
use std::sync::atomic::AtomicU64;

#[cfg(unix)]
use nix::libc;
use parking_lot::Mutex;

use crate::entry::{self, ChunkEntry, ADDRESS_MASK, CHUNK_SIZE_MAX};
use crate::error::{Error, Result};

/// Block header size in bytes.
const HEADER_SIZE: u64 = 8;
/// Smallest block: header + two free-list links + footer.
const MIN_BLOCK: u64 = 32;

/// Header bit: block is on a free list.
const FLAG_FREE: u64 = 1 << 63;
/// Header bit: the block immediately before this one is free (its footer sits
/// directly below this header).
const FLAG_PREV_FREE: u64 = 1 << 62;
const SIZE_MASK: u64 = !(FLAG_FREE | FLAG_PREV_FREE);

/// Size classes are indexed by floor(log2(block size)); block sizes are
/// bounded by the 43-bit address space.
const NUM_CLASSES: usize = 44;

/// Smallest heap the allocator accepts.
pub const MIN_HEAP_CAPACITY: usize = 1 << 16;
/// Largest addressable heap (43-bit addresses).
pub const MAX_HEAP_CAPACITY: usize = 1 << entry::ADDRESS_BITS;

#[inline]
const fn round_up8(value: u64) -> u64 {
    (value + 7) & !7
}

#[inline]
fn class_of(size: u64) -> usize {
    debug_assert!(size >= MIN_BLOCK);
    (63 - size.leading_zeros() as usize).min(NUM_CLASSES - 1)
}

/// Free-list heads plus bookkeeping, all behind one mutex.
struct FreeLists {
    /// Head block address per size class; 0 = empty (offset 0 is the burned
    /// init block and never a real block address).
    heads: [u64; NUM_CLASSES],
    free_bytes: u64,
    free_blocks: u64,
    allocated_blocks: u64,
}

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStatus {
    /// Total region size in bytes.
    pub capacity: u64,
    /// Bytes currently on free lists (including block headers).
    pub free_bytes: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of live allocations (chunks and table blocks).
    pub allocated_blocks: u64,
}

/// The pre-reserved memory region all chunks live in.
pub struct Heap {
    base: *mut u8,
    capacity: u64,
    lists: Mutex<FreeLists>,
}

// The raw base pointer is only a window onto the fixed region; concurrent
// payload access is guarded by per-chunk locks, free-list state by the mutex.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Reserve a region of `capacity` bytes and set up the free list.
    ///
    /// Capacity is rounded down to a multiple of 8 and must stay within
    /// [`MIN_HEAP_CAPACITY`], [`MAX_HEAP_CAPACITY`].
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = (capacity & !7) as u64;
        assert!(
            (MIN_HEAP_CAPACITY as u64..=MAX_HEAP_CAPACITY as u64).contains(&capacity),
            "heap capacity {capacity} out of range"
        );
        assert!(capacity - HEADER_SIZE <= ADDRESS_MASK);

        let base = Self::reserve(capacity as usize)?;

        let heap = Self {
            base,
            capacity,
            lists: Mutex::new(FreeLists {
                heads: [0; NUM_CLASSES],
                free_bytes: 0,
                free_blocks: 0,
                allocated_blocks: 0,
            }),
        };

        // Burn offset 0 with a permanently allocated header-only block so no
        // chunk address can ever be 0 (the free-slot sentinel) and 0 can act
        // as the free-list null link.
        heap.set_header(0, HEADER_SIZE, false, false);

        let mut lists = heap.lists.lock();
        let first = HEADER_SIZE;
        let size = capacity - HEADER_SIZE;
        heap.set_header(first, size, true, false);
        heap.set_footer(first, size);
        heap.push_free(&mut lists, first, size);
        lists.free_bytes = size;
        lists.free_blocks = 1;
        drop(lists);

        tracing::debug!(capacity, "heap region reserved");
        Ok(heap)
    }

    #[cfg(unix)]
    fn reserve(capacity: usize) -> Result<*mut u8> {
        // SAFETY: plain anonymous private mapping; failure is checked below.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        Ok(base as *mut u8)
    }

    #[cfg(not(unix))]
    fn reserve(capacity: usize) -> Result<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(capacity, 4096)
            .map_err(|_| Error::OutOfMemory)?;
        // SAFETY: layout is non-zero sized.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::OutOfMemory);
        }
        Ok(base)
    }

    /// Total region size in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocator counters.
    pub fn status(&self) -> HeapStatus {
        let lists = self.lists.lock();
        HeapStatus {
            capacity: self.capacity,
            free_bytes: lists.free_bytes,
            free_blocks: lists.free_blocks,
            allocated_blocks: lists.allocated_blocks,
        }
    }

    // ========================================================================
    // Chunk allocation
    // ========================================================================

    /// Allocate a chunk of `size` payload bytes.
    ///
    /// On success the entry's address and length fields are populated and the
    /// overflow prefix (if any) has been written into the heap. On failure
    /// the entry is left untouched.
    pub fn malloc(&self, entry: &mut ChunkEntry, size: usize) -> Result<()> {
        if size == 0 || size > CHUNK_SIZE_MAX {
            return Err(Error::SizeOutOfRange(size));
        }

        let prefix = entry::prefix_bytes(size) as u64;
        let need = round_up8(HEADER_SIZE + prefix + size as u64).max(MIN_BLOCK);

        let block = {
            let mut lists = self.lists.lock();
            self.alloc_block(&mut lists, need).ok_or(Error::OutOfMemory)?
        };

        entry.set_length(size);
        entry.set_address(block + HEADER_SIZE + prefix);
        self.write_prefix(entry);
        Ok(())
    }

    /// Allocate a batch of chunks, all-or-nothing.
    ///
    /// On out-of-memory every chunk allocated so far is rolled back and the
    /// corresponding entries are reset to the invalid-address marker.
    pub fn malloc_batch(&self, entries: &mut [ChunkEntry], sizes: &[usize]) -> Result<()> {
        assert_eq!(entries.len(), sizes.len());

        for i in 0..sizes.len() {
            if let Err(err) = self.malloc(&mut entries[i], sizes[i]) {
                for j in 0..i {
                    self.free(&entries[j]);
                    entries[j] = ChunkEntry::new_free();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release a chunk's block (overflow prefix included) back to the free
    /// list.
    pub fn free(&self, entry: &ChunkEntry) {
        assert!(entry.is_address_valid());
        let block = entry.address() - entry.split_size() as u64 - HEADER_SIZE;
        let mut lists = self.lists.lock();
        self.free_block(&mut lists, block);
    }

    /// Resize a chunk. In place when the existing block can hold the new
    /// layout, otherwise allocate-copy-free.
    ///
    /// Returns `true` when the payload address changed. On failure the chunk
    /// is untouched.
    pub fn resize(&self, entry: &mut ChunkEntry, new_size: usize) -> Result<bool> {
        if new_size == 0 || new_size > CHUNK_SIZE_MAX {
            return Err(Error::SizeOutOfRange(new_size));
        }

        let old_size = self.payload_size(entry);
        if new_size == old_size {
            return Ok(false);
        }

        let old_prefix = entry.split_size() as u64;
        let new_prefix = entry::prefix_bytes(new_size) as u64;
        let block = entry.address() - old_prefix - HEADER_SIZE;
        let need = round_up8(HEADER_SIZE + old_prefix + new_size as u64).max(MIN_BLOCK);

        // In place iff the payload stays put: the prefix size must be
        // unchanged (the block start is recovered from it on free) and the
        // block must cover the new end. Block headers are only stable under
        // the list mutex (a neighbor free may rewrite flag bits).
        let in_place = {
            let mut lists = self.lists.lock();
            let header = self.header(block);
            let block_size = header & SIZE_MASK;
            let fits = new_prefix == old_prefix && need <= block_size;

            if fits && block_size - need >= MIN_BLOCK {
                // Return the surplus tail to the free list.
                self.set_header(block, need, false, header & FLAG_PREV_FREE != 0);
                let rem = block + need;
                self.set_header(rem, block_size - need, false, false);
                lists.allocated_blocks += 1;
                self.free_block(&mut lists, rem);
            }
            fits
        };

        if in_place {
            entry.set_length(new_size);
            self.write_prefix(entry);
            return Ok(false);
        }

        let mut moved = ChunkEntry::new_free();
        self.malloc(&mut moved, new_size)?;
        self.move_payload(entry.address(), moved.address(), old_size.min(new_size));

        let mut lists = self.lists.lock();
        self.free_block(&mut lists, block);
        drop(lists);

        entry.set_length(new_size);
        entry.set_address(moved.address());
        Ok(true)
    }

    /// Allocate a zeroed, 8-aligned block for a CID table. Table blocks live
    /// for the process lifetime; there is no matching free.
    pub(crate) fn alloc_table_block(&self, size: usize) -> Option<u64> {
        let need = round_up8(HEADER_SIZE + size as u64).max(MIN_BLOCK);
        let block = {
            let mut lists = self.lists.lock();
            self.alloc_block(&mut lists, need)?
        };
        let addr = block + HEADER_SIZE;
        // SAFETY: [addr, addr + size) is inside the freshly allocated block.
        unsafe {
            ptr::write_bytes(self.base.add(addr as usize), 0, size);
        }
        Some(addr)
    }

    /// Total payload size of a chunk, reconstructing split lengths from the
    /// overflow prefix in front of the payload.
    pub fn payload_size(&self, entry: &ChunkEntry) -> usize {
        if entry.is_length_embedded() {
            entry.embedded_length()
        } else {
            let n = entry.split_size();
            debug_assert!((1..=3).contains(&n));
            let base = entry.address() - n as u64;
            let mut msb = 0u32;
            for i in 0..n {
                msb |= (self.read_raw_u8(base + i as u64) as u32) << (8 * i);
            }
            entry.combine_split_length(msb)
        }
    }

    /// Write the overflow prefix bytes for a split-length entry.
    fn write_prefix(&self, entry: &ChunkEntry) {
        let n = entry.split_size();
        if n == 0 {
            return;
        }
        let msb = entry.split_msb();
        let base = entry.address() - n as u64;
        for i in 0..n {
            self.write_raw_u8(base + i as u64, (msb >> (8 * i)) as u8);
        }
    }

    /// Copy `len` payload bytes from one chunk location to another. Used by
    /// the defragmenter while it holds the exclusive gate and the chunk's
    /// write lock.
    pub fn move_payload(&self, from: u64, to: u64, len: usize) {
        debug_assert!(from + len as u64 <= self.capacity);
        debug_assert!(to + len as u64 <= self.capacity);
        // SAFETY: both ranges are in bounds; blocks may not overlap but copy
        // tolerates it.
        unsafe {
            ptr::copy(
                self.base.add(from as usize),
                self.base.add(to as usize),
                len,
            );
        }
    }

    // ========================================================================
    // Free-list internals (lists mutex held)
    // ========================================================================

    fn alloc_block(&self, lists: &mut FreeLists, need: u64) -> Option<u64> {
        debug_assert_eq!(need % 8, 0);
        debug_assert!(need >= MIN_BLOCK);

        let start_class = class_of(need);

        // First fit inside the request's own class; blocks there may be
        // smaller than the request.
        let mut block = lists.heads[start_class];
        let mut found = 0;
        while block != 0 {
            if self.header(block) & SIZE_MASK >= need {
                found = block;
                break;
            }
            block = self.link_next(block);
        }

        // Any block in a higher class is large enough.
        if found == 0 {
            for class in start_class + 1..NUM_CLASSES {
                if lists.heads[class] != 0 {
                    found = lists.heads[class];
                    break;
                }
            }
        }

        if found == 0 {
            return None;
        }

        let block_size = self.header(found) & SIZE_MASK;
        self.unlink(lists, found, block_size);
        lists.free_blocks -= 1;

        if block_size - need >= MIN_BLOCK {
            // Split: keep the head, free the tail.
            self.set_header(found, need, false, false);
            let rem = found + need;
            let rem_size = block_size - need;
            self.set_header(rem, rem_size, true, false);
            self.set_footer(rem, rem_size);
            self.push_free(lists, rem, rem_size);
            lists.free_blocks += 1;
            lists.free_bytes -= need;
            // The block after the remainder still has a free predecessor.
        } else {
            self.set_header(found, block_size, false, false);
            let follow = found + block_size;
            if follow < self.capacity {
                self.clear_prev_free(follow);
            }
            lists.free_bytes -= block_size;
        }

        lists.allocated_blocks += 1;
        Some(found)
    }

    fn free_block(&self, lists: &mut FreeLists, block: u64) {
        let header = self.header(block);
        debug_assert_eq!(header & FLAG_FREE, 0, "double free at {block:#x}");

        let freed = header & SIZE_MASK;
        let mut start = block;
        let mut total = freed;

        // Merge with the following block.
        let next = block + total;
        if next < self.capacity {
            let next_header = self.header(next);
            if next_header & FLAG_FREE != 0 {
                let next_size = next_header & SIZE_MASK;
                self.unlink(lists, next, next_size);
                lists.free_blocks -= 1;
                total += next_size;
            }
        }

        // Merge with the preceding block (its footer sits right below us).
        if header & FLAG_PREV_FREE != 0 {
            let prev_size = self.read_raw_u64(block - 8);
            let prev = block - prev_size;
            debug_assert!(self.header(prev) & FLAG_FREE != 0);
            self.unlink(lists, prev, prev_size);
            lists.free_blocks -= 1;
            start = prev;
            total += prev_size;
        }

        // Free blocks never have a free predecessor.
        self.set_header(start, total, true, false);
        self.set_footer(start, total);
        self.push_free(lists, start, total);

        let follow = start + total;
        if follow < self.capacity {
            self.set_prev_free(follow);
        }

        lists.free_bytes += freed;
        lists.free_blocks += 1;
        lists.allocated_blocks -= 1;
    }

    fn push_free(&self, lists: &mut FreeLists, block: u64, size: u64) {
        let class = class_of(size);
        let head = lists.heads[class];
        self.set_link_next(block, head);
        self.set_link_prev(block, 0);
        if head != 0 {
            self.set_link_prev(head, block);
        }
        lists.heads[class] = block;
    }

    fn unlink(&self, lists: &mut FreeLists, block: u64, size: u64) {
        let class = class_of(size);
        let next = self.link_next(block);
        let prev = self.link_prev(block);
        if prev != 0 {
            self.set_link_next(prev, next);
        } else {
            debug_assert_eq!(lists.heads[class], block);
            lists.heads[class] = next;
        }
        if next != 0 {
            self.set_link_prev(next, prev);
        }
    }

    // ========================================================================
    // Boundary tags and links
    // ========================================================================

    fn header(&self, block: u64) -> u64 {
        self.read_raw_u64(block)
    }

    fn set_header(&self, block: u64, size: u64, free: bool, prev_free: bool) {
        debug_assert!(block + size <= self.capacity);
        let mut val = size;
        if free {
            val |= FLAG_FREE;
        }
        if prev_free {
            val |= FLAG_PREV_FREE;
        }
        self.write_raw_u64(block, val);
    }

    fn set_footer(&self, block: u64, size: u64) {
        self.write_raw_u64(block + size - 8, size);
    }

    fn set_prev_free(&self, block: u64) {
        let header = self.header(block);
        self.write_raw_u64(block, header | FLAG_PREV_FREE);
    }

    fn clear_prev_free(&self, block: u64) {
        let header = self.header(block);
        self.write_raw_u64(block, header & !FLAG_PREV_FREE);
    }

    fn link_next(&self, block: u64) -> u64 {
        self.read_raw_u64(block + 8)
    }

    fn link_prev(&self, block: u64) -> u64 {
        self.read_raw_u64(block + 16)
    }

    fn set_link_next(&self, block: u64, next: u64) {
        self.write_raw_u64(block + 8, next);
    }

    fn set_link_prev(&self, block: u64, prev: u64) {
        self.write_raw_u64(block + 16, prev);
    }

    // ========================================================================
    // Raw access
    // ========================================================================

    #[inline]
    fn read_raw_u8(&self, addr: u64) -> u8 {
        debug_assert!(addr < self.capacity);
        // SAFETY: bounds asserted; region is mapped for the heap's lifetime.
        unsafe { ptr::read(self.base.add(addr as usize)) }
    }

    #[inline]
    fn write_raw_u8(&self, addr: u64, value: u8) {
        debug_assert!(addr < self.capacity);
        // SAFETY: see read_raw_u8.
        unsafe { ptr::write(self.base.add(addr as usize), value) }
    }

    #[inline]
    fn read_raw_u64(&self, addr: u64) -> u64 {
        debug_assert!(addr % 8 == 0 && addr + 8 <= self.capacity);
        // SAFETY: aligned and in bounds.
        unsafe { ptr::read(self.base.add(addr as usize) as *const u64) }
    }

    #[inline]
    fn write_raw_u64(&self, addr: u64, value: u64) {
        debug_assert!(addr % 8 == 0 && addr + 8 <= self.capacity);
        // SAFETY: aligned and in bounds.
        unsafe { ptr::write(self.base.add(addr as usize) as *mut u64, value) }
    }

    /// Atomic view of the 8-aligned word at `addr`. The CID table CASes its
    /// slot words through this.
    #[inline]
    pub(crate) fn atomic_u64(&self, addr: u64) -> &AtomicU64 {
        debug_assert!(addr % 8 == 0 && addr + 8 <= self.capacity);
        // SAFETY: aligned, in bounds, and AtomicU64 has the same layout as u64.
        unsafe { &*(self.base.add(addr as usize) as *const AtomicU64) }
    }

    // ========================================================================
    // Typed payload access
    // ========================================================================

    /// Read one byte at `address + offset`.
    #[inline]
    pub fn read_u8(&self, address: u64, offset: u64) -> u8 {
        self.read_raw_u8(address + offset)
    }

    /// Write one byte at `address + offset`.
    #[inline]
    pub fn write_u8(&self, address: u64, offset: u64, value: u8) {
        self.write_raw_u8(address + offset, value)
    }

    /// Read a host-endian `u16` cell.
    #[inline]
    pub fn read_u16(&self, address: u64, offset: u64) -> u16 {
        let addr = address + offset;
        debug_assert!(addr + 2 <= self.capacity);
        // SAFETY: in bounds; payload cells are not necessarily aligned.
        unsafe { ptr::read_unaligned(self.base.add(addr as usize) as *const u16) }
    }

    /// Write a host-endian `u16` cell.
    #[inline]
    pub fn write_u16(&self, address: u64, offset: u64, value: u16) {
        let addr = address + offset;
        debug_assert!(addr + 2 <= self.capacity);
        // SAFETY: see read_u16.
        unsafe { ptr::write_unaligned(self.base.add(addr as usize) as *mut u16, value) }
    }

    /// Read a host-endian `u32` cell.
    #[inline]
    pub fn read_u32(&self, address: u64, offset: u64) -> u32 {
        let addr = address + offset;
        debug_assert!(addr + 4 <= self.capacity);
        // SAFETY: see read_u16.
        unsafe { ptr::read_unaligned(self.base.add(addr as usize) as *const u32) }
    }

    /// Write a host-endian `u32` cell.
    #[inline]
    pub fn write_u32(&self, address: u64, offset: u64, value: u32) {
        let addr = address + offset;
        debug_assert!(addr + 4 <= self.capacity);
        // SAFETY: see read_u16.
        unsafe { ptr::write_unaligned(self.base.add(addr as usize) as *mut u32, value) }
    }

    /// Read a host-endian `u64` cell.
    #[inline]
    pub fn read_u64(&self, address: u64, offset: u64) -> u64 {
        let addr = address + offset;
        debug_assert!(addr + 8 <= self.capacity);
        // SAFETY: see read_u16.
        unsafe { ptr::read_unaligned(self.base.add(addr as usize) as *const u64) }
    }

    /// Write a host-endian `u64` cell.
    #[inline]
    pub fn write_u64(&self, address: u64, offset: u64, value: u64) {
        let addr = address + offset;
        debug_assert!(addr + 8 <= self.capacity);
        // SAFETY: see read_u16.
        unsafe { ptr::write_unaligned(self.base.add(addr as usize) as *mut u64, value) }
    }

    /// Copy bytes out of the region. Returns the count read, or `None` if the
    /// range overruns the region.
    pub fn read_bytes(&self, address: u64, offset: u64, dst: &mut [u8]) -> Option<usize> {
        let addr = address.checked_add(offset)?;
        if addr.checked_add(dst.len() as u64)? > self.capacity {
            return None;
        }
        // SAFETY: range checked against capacity.
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(addr as usize), dst.as_mut_ptr(), dst.len());
        }
        Some(dst.len())
    }

    /// Copy bytes into the region. Returns the count written, or `None` if
    /// the range overruns the region.
    pub fn write_bytes(&self, address: u64, offset: u64, src: &[u8]) -> Option<usize> {
        let addr = address.checked_add(offset)?;
        if addr.checked_add(src.len() as u64)? > self.capacity {
            return None;
        }
        // SAFETY: range checked against capacity.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(addr as usize), src.len());
        }
        Some(src.len())
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: base/capacity are the exact mapping from Heap::new.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity as usize);
        }
        #[cfg(not(unix))]
        // SAFETY: same layout as the allocation in Heap::new.
        unsafe {
            let layout =
                std::alloc::Layout::from_size_align_unchecked(self.capacity as usize, 4096);
            std::alloc::dealloc(self.base, layout);
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("Heap")
            .field("capacity", &self.capacity)
            .field("free_bytes", &status.free_bytes)
            .field("allocated_blocks", &status.allocated_blocks)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
