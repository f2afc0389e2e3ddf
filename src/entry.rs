//! Chunk entry word codec.
//!
//! Every leaf slot of the CID table holds one 64-bit entry word describing a
//! chunk. Layout, LSB to MSB:
//!
//! ```text
//! | pinned 1 | write lock 1 | read lock 7 | embedded flag 1 | length field 11 | address 43 |
//!   bit 63     bit 62         bits 55-61    bit 54            bits 43-53        bits 0-42
//! ```
//!
//! When the embedded flag is clear the 11-bit length field is repurposed as
//! split metadata: bits 43-50 carry the low 8 bits of the chunk size and bits
//! 51-52 the number of overflow bytes (1-3) stored in the heap immediately
//! before the payload.
//!
//! [`ChunkEntry`] is a materialized copy of such a word: it caches the heap
//! address the word was read from (`pointer`), the word as last seen
//! (`initial`), and the decoded fields. Mutations touch only the cached
//! fields; [`ChunkEntry::encode`] recomposes the word that a compare-and-swap
//! against `initial` writes back.

use std::fmt;

// ============================================================================
// Layout
// ============================================================================

/// Width of the heap address field in bits.
pub const ADDRESS_BITS: u32 = 43;
/// Mask covering the address field.
pub const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
/// Invalid-address sentinel (all ones in 43 bits).
pub const ADDRESS_INVALID: u64 = ADDRESS_MASK;

const BITS_EMBEDDED_LENGTH: u32 = 11;
const BITS_EMBEDDED_FLAG: u32 = 1;
const BITS_READ_LOCK: u32 = 7;
const BITS_WRITE_LOCK: u32 = 1;

const OFFSET_ADDRESS: u32 = 0;
const OFFSET_EMBEDDED_LENGTH: u32 = OFFSET_ADDRESS + ADDRESS_BITS;
const OFFSET_EMBEDDED_FLAG: u32 = OFFSET_EMBEDDED_LENGTH + BITS_EMBEDDED_LENGTH;
const OFFSET_READ_LOCK: u32 = OFFSET_EMBEDDED_FLAG + BITS_EMBEDDED_FLAG;
const OFFSET_WRITE_LOCK: u32 = OFFSET_READ_LOCK + BITS_READ_LOCK;
const OFFSET_PINNED: u32 = OFFSET_WRITE_LOCK + BITS_WRITE_LOCK;

const MASK_EMBEDDED_LENGTH: u64 = (1 << BITS_EMBEDDED_LENGTH) - 1;
const MASK_READ_LOCK: u64 = (1 << BITS_READ_LOCK) - 1;

// Split length field: low 8 bits of the size stay in the entry, the number of
// overflow bytes (1-3) in the heap prefix is recorded in 2 bits above them.
const BITS_SPLIT_LSB: u32 = 8;
const BITS_SPLIT_SIZE: u32 = 2;

const OFFSET_SPLIT_LSB: u32 = OFFSET_EMBEDDED_LENGTH;
const OFFSET_SPLIT_SIZE: u32 = OFFSET_SPLIT_LSB + BITS_SPLIT_LSB;

const MASK_SPLIT_LSB: u64 = (1 << BITS_SPLIT_LSB) - 1;
const MASK_SPLIT_SIZE: u64 = (1 << BITS_SPLIT_SIZE) - 1;

/// Largest chunk size whose length field fits inline (11 bits).
pub const EMBEDDED_LENGTH_MAX: usize = MASK_EMBEDDED_LENGTH as usize;

/// Largest representable chunk size: 24 bits of overflow prefix plus the
/// 8-bit LSB in the entry.
pub const CHUNK_SIZE_MAX: usize = u32::MAX as usize;

/// Maximum concurrent readers encodable in the read-lock counter.
pub const READ_LOCK_MAX: u8 = MASK_READ_LOCK as u8;

// ============================================================================
// Sentinel words
// ============================================================================

/// Raw word of an unused leaf slot.
pub const RAW_FREE: u64 = 0;

/// Raw word of a slot whose chunk was removed. Retained so the CID is not
/// re-issued until zombie cleanup runs.
pub const RAW_ZOMBIE: u64 = ADDRESS_INVALID;

/// Raw word of a slot reserved through the reserve operation but not yet
/// backed by memory.
pub const RAW_RESERVED: u64 = ADDRESS_INVALID | 1 << OFFSET_EMBEDDED_FLAG;

/// Extract the address field from a raw entry word without a full decode.
#[inline]
pub const fn raw_address(raw: u64) -> u64 {
    raw >> OFFSET_ADDRESS & ADDRESS_MASK
}

/// Number of overflow bytes a chunk of `total` bytes stores in the heap in
/// front of its payload (0 for embedded lengths).
#[inline]
pub const fn prefix_bytes(total: usize) -> usize {
    if total <= EMBEDDED_LENGTH_MAX {
        0
    } else {
        min_storage_bytes((total >> BITS_SPLIT_LSB) as u64)
    }
}

/// Minimum number of bytes needed to store `val`.
const fn min_storage_bytes(val: u64) -> usize {
    let mut n = 0;
    let mut v = val;
    while v != 0 {
        v >>= 8;
        n += 1;
    }
    n
}

// ============================================================================
// Materialized entry
// ============================================================================

/// A chunk entry word materialized out of its leaf slot.
///
/// Plain `Copy` stack value; nothing here references the slot itself. The
/// slot is re-read through `CidTable::entry_reread` and written back through
/// `CidTable::entry_atomic_update`.
#[derive(Clone, Copy)]
pub struct ChunkEntry {
    /// Heap address of the leaf slot this word lives in.
    pointer: u64,
    /// Word as last read from the slot; the CAS compare value.
    initial: u64,

    pinned: bool,
    write_lock: bool,
    read_lock: u8,
    length_embedded: bool,
    embedded_length: u32,

    /// Overflow byte count (1-3) when the length field is split.
    split_size: u8,
    /// Low 8 bits of the size when the length field is split.
    split_lsb: u8,
    /// High bits of the size; computed by [`set_length`](Self::set_length),
    /// never stored in the word itself.
    split_msb: u32,

    address: u64,
}

impl ChunkEntry {
    /// An empty entry pointing nowhere.
    pub const fn new_free() -> Self {
        Self {
            pointer: ADDRESS_INVALID,
            initial: RAW_FREE,
            pinned: false,
            write_lock: false,
            read_lock: 0,
            length_embedded: false,
            embedded_length: 0,
            split_size: 0,
            split_lsb: 0,
            split_msb: 0,
            address: ADDRESS_INVALID,
        }
    }

    /// Materialize a raw word read from the slot at `pointer`.
    pub fn decode(pointer: u64, raw: u64) -> Self {
        let mut entry = Self::new_free();
        entry.set(pointer, raw);
        entry
    }

    /// Re-initialize from a freshly read word. Decoded fields and the CAS
    /// compare value are replaced; `split_msb` is reset (it lives in the heap
    /// prefix, not in the word).
    pub fn set(&mut self, pointer: u64, raw: u64) {
        self.pointer = pointer;
        self.initial = raw;

        self.pinned = raw >> OFFSET_PINNED & 1 != 0;
        self.write_lock = raw >> OFFSET_WRITE_LOCK & 1 != 0;
        self.read_lock = (raw >> OFFSET_READ_LOCK & MASK_READ_LOCK) as u8;
        self.length_embedded = raw >> OFFSET_EMBEDDED_FLAG & 1 != 0;

        if self.length_embedded {
            self.embedded_length = (raw >> OFFSET_EMBEDDED_LENGTH & MASK_EMBEDDED_LENGTH) as u32;
            self.split_size = 0;
            self.split_lsb = 0;
        } else {
            self.embedded_length = 0;
            self.split_size = (raw >> OFFSET_SPLIT_SIZE & MASK_SPLIT_SIZE) as u8;
            self.split_lsb = (raw >> OFFSET_SPLIT_LSB & MASK_SPLIT_LSB) as u8;
        }
        self.split_msb = 0;

        self.address = raw >> OFFSET_ADDRESS & ADDRESS_MASK;
    }

    /// Recompose the word from the cached fields. This is the CAS write-back
    /// value.
    pub fn encode(&self) -> u64 {
        debug_assert!(self.address <= ADDRESS_MASK);
        debug_assert!(self.read_lock <= READ_LOCK_MAX);

        let mut raw = 0u64;

        raw |= (self.pinned as u64) << OFFSET_PINNED;
        raw |= (self.write_lock as u64) << OFFSET_WRITE_LOCK;
        raw |= (self.read_lock as u64 & MASK_READ_LOCK) << OFFSET_READ_LOCK;
        raw |= (self.length_embedded as u64) << OFFSET_EMBEDDED_FLAG;

        if self.length_embedded {
            raw |= (self.embedded_length as u64 & MASK_EMBEDDED_LENGTH) << OFFSET_EMBEDDED_LENGTH;
        } else {
            raw |= (self.split_size as u64 & MASK_SPLIT_SIZE) << OFFSET_SPLIT_SIZE;
            raw |= (self.split_lsb as u64 & MASK_SPLIT_LSB) << OFFSET_SPLIT_LSB;
        }

        raw |= self.address << OFFSET_ADDRESS & ADDRESS_MASK;

        raw
    }

    /// Heap address of the leaf slot this word was read from.
    pub fn pointer(&self) -> u64 {
        self.pointer
    }

    /// Set the leaf-slot address.
    pub fn set_pointer(&mut self, pointer: u64) {
        self.pointer = pointer;
    }

    /// Word as last read from the slot (the CAS compare value).
    pub fn initial(&self) -> u64 {
        self.initial
    }

    pub(crate) fn set_initial(&mut self, raw: u64) {
        self.initial = raw;
    }

    /// A chunk entry is valid if it was read from a real slot and the slot
    /// held neither the free, zombie nor reserved sentinel.
    pub fn is_valid(&self) -> bool {
        self.pointer != ADDRESS_INVALID
            && self.initial != RAW_FREE
            && self.initial != RAW_ZOMBIE
            && self.initial != RAW_RESERVED
    }

    /// Whether the defragmenter must leave this chunk in place.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Flip the pin flag in the cached fields.
    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    /// Whether the write-lock bit is set in the cached fields.
    pub fn is_write_locked(&self) -> bool {
        self.write_lock
    }

    /// Set the write-lock bit. Returns false if it was already set.
    pub fn acquire_write_lock(&mut self) -> bool {
        if self.write_lock {
            false
        } else {
            self.write_lock = true;
            true
        }
    }

    /// Clear the write-lock bit.
    pub fn release_write_lock(&mut self) {
        assert!(self.write_lock, "releasing write lock that is not held");
        self.write_lock = false;
    }

    /// Number of readers currently counted in the cached fields.
    pub fn read_lock_count(&self) -> u8 {
        self.read_lock
    }

    /// Whether any readers are counted.
    pub fn are_read_locks_acquired(&self) -> bool {
        self.read_lock > 0
    }

    /// Bump the reader counter. Returns false when saturated at
    /// [`READ_LOCK_MAX`]; the caller yields and retries.
    pub fn acquire_read_lock(&mut self) -> bool {
        if self.read_lock == READ_LOCK_MAX {
            false
        } else {
            self.read_lock += 1;
            true
        }
    }

    /// Drop one reader from the counter.
    pub fn release_read_lock(&mut self) {
        assert!(self.read_lock > 0, "releasing read lock that is not held");
        self.read_lock -= 1;
    }

    /// Whether the chunk size fits inline in the entry word.
    pub fn is_length_embedded(&self) -> bool {
        self.length_embedded
    }

    /// Inline chunk size; meaningful only when embedded.
    pub fn embedded_length(&self) -> usize {
        self.embedded_length as usize
    }

    /// Number of overflow bytes in the heap prefix (1-3); 0 when embedded.
    pub fn split_size(&self) -> usize {
        self.split_size as usize
    }

    /// Low 8 bits of the chunk size when split.
    pub fn split_lsb(&self) -> u8 {
        self.split_lsb
    }

    /// High bits of the chunk size as computed by the last
    /// [`set_length`](Self::set_length) call.
    pub fn split_msb(&self) -> u32 {
        self.split_msb
    }

    /// Set the total chunk size, choosing embedded or split representation.
    pub fn set_length(&mut self, total: usize) {
        assert!(total <= CHUNK_SIZE_MAX, "chunk size {total} out of range");

        if total > EMBEDDED_LENGTH_MAX {
            self.length_embedded = false;
            self.embedded_length = 0;

            self.split_msb = (total >> BITS_SPLIT_LSB) as u32;
            self.split_lsb = (total as u64 & MASK_SPLIT_LSB) as u8;
            self.split_size = min_storage_bytes(self.split_msb as u64) as u8;
        } else {
            self.split_msb = 0;
            self.split_lsb = 0;
            self.split_size = 0;

            self.length_embedded = true;
            self.embedded_length = total as u32;
        }
    }

    /// Combine overflow-prefix data read from the heap with the in-entry LSB
    /// into the full chunk size.
    pub fn combine_split_length(&self, msb: u32) -> usize {
        ((msb as usize) << BITS_SPLIT_LSB) | self.split_lsb as usize
    }

    /// Whether the address field holds a real heap address.
    pub fn is_address_valid(&self) -> bool {
        self.address != ADDRESS_INVALID
    }

    /// Heap address of the payload start.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Set the payload address.
    pub fn set_address(&mut self, address: u64) {
        debug_assert!(address <= ADDRESS_MASK);
        self.address = address;
    }
}

impl fmt::Debug for ChunkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkEntry")
            .field("pointer", &format_args!("{:#x}", self.pointer))
            .field("initial", &format_args!("{:#018x}", self.initial))
            .field("pinned", &self.pinned)
            .field("write_lock", &self.write_lock)
            .field("read_lock", &self.read_lock)
            .field("length_embedded", &self.length_embedded)
            .field("embedded_length", &self.embedded_length)
            .field("split_size", &self.split_size)
            .field("split_lsb", &self.split_lsb)
            .field("split_msb", &self.split_msb)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}
