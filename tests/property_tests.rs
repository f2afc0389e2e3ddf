//! Property-based tests for the chunk store codecs.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use chunkstore::entry::{
    self, ChunkEntry, ADDRESS_MASK, CHUNK_SIZE_MAX, EMBEDDED_LENGTH_MAX, READ_LOCK_MAX,
};
use chunkstore::{BufferImExporter, ChunkId, Exporter, Heap, Importer};
use proptest::prelude::*;

/// Strategy for representable chunk sizes.
fn chunk_size() -> impl Strategy<Value = usize> {
    prop_oneof![
        0usize..=EMBEDDED_LENGTH_MAX,
        // Force the split range to be exercised as often as the embedded one.
        EMBEDDED_LENGTH_MAX + 1..=CHUNK_SIZE_MAX,
        Just(EMBEDDED_LENGTH_MAX),
        Just(EMBEDDED_LENGTH_MAX + 1),
        Just(CHUNK_SIZE_MAX),
    ]
}

/// Strategy for valid payload addresses (anything below the invalid
/// sentinel).
fn address() -> impl Strategy<Value = u64> {
    0u64..ADDRESS_MASK
}

proptest! {
    /// Length-field round-trip: embedded or split, the size always
    /// reconstructs exactly.
    #[test]
    fn length_field_roundtrip(size in chunk_size()) {
        let mut e = ChunkEntry::new_free();
        e.set_length(size);

        let total = if e.is_length_embedded() {
            e.embedded_length()
        } else {
            e.combine_split_length(e.split_msb())
        };
        prop_assert_eq!(total, size);

        // Embedded-vs-split threshold.
        prop_assert_eq!(e.is_length_embedded(), size <= EMBEDDED_LENGTH_MAX);
        prop_assert_eq!(e.split_size(), entry::prefix_bytes(size));
    }

    /// Entry word encode/decode identity over all field combinations.
    #[test]
    fn entry_word_roundtrip(
        addr in address(),
        size in chunk_size(),
        pinned in any::<bool>(),
        readers in 0u8..=READ_LOCK_MAX,
        write_locked in any::<bool>(),
    ) {
        let mut e = ChunkEntry::new_free();
        e.set_length(size);
        e.set_address(addr);
        e.set_pinned(pinned);
        for _ in 0..readers {
            prop_assert!(e.acquire_read_lock());
        }
        if write_locked {
            prop_assert!(e.acquire_write_lock());
        }

        let raw = e.encode();
        let d = ChunkEntry::decode(0x40, raw);

        prop_assert_eq!(d.address(), addr);
        prop_assert_eq!(d.is_pinned(), pinned);
        prop_assert_eq!(d.read_lock_count(), readers);
        prop_assert_eq!(d.is_write_locked(), write_locked);
        prop_assert_eq!(d.is_length_embedded(), e.is_length_embedded());
        prop_assert_eq!(d.embedded_length(), e.embedded_length());
        prop_assert_eq!(d.split_size(), e.split_size());
        prop_assert_eq!(d.split_lsb(), e.split_lsb());
        prop_assert_eq!(d.encode(), raw);
    }

    /// CID split round-trip.
    #[test]
    fn cid_roundtrip(nid in any::<u16>(), lid in 1u64..=chunkstore::cid::LID_MAX) {
        let cid = ChunkId::new(nid, lid);
        prop_assert_eq!(cid.nid(), nid);
        prop_assert_eq!(cid.lid(), lid);
        prop_assert!(cid.is_valid());
        prop_assert_eq!(ChunkId::from_raw(cid.raw()), cid);
    }

    /// Compact number round-trip through a buffer cursor.
    #[test]
    fn compact_number_roundtrip(value in any::<u32>()) {
        let mut buf = [0u8; 8];
        let mut ex = BufferImExporter::new(&mut buf);
        ex.write_compact_u32(value);
        let written = ex.position();
        prop_assert_eq!(written, chunkstore::imexport::compact_number_len(value));

        let mut im = BufferImExporter::new(&mut buf);
        prop_assert_eq!(im.read_compact_u32(), value);
        prop_assert_eq!(im.position(), written);
    }

    /// Heap-backed length round-trip: the overflow prefix written at malloc
    /// time reconstructs the exact size.
    #[test]
    fn heap_length_roundtrip(size in 1usize..=1 << 16) {
        let heap = Heap::new(1 << 20).unwrap();
        let mut e = ChunkEntry::new_free();
        heap.malloc(&mut e, size).unwrap();
        prop_assert_eq!(heap.payload_size(&e), size);
        heap.free(&e);
    }

    /// Payload bytes survive a write/read cycle at arbitrary offsets.
    #[test]
    fn heap_bytes_roundtrip(
        data in prop::collection::vec(any::<u8>(), 1..512),
        pad in 0u64..64,
    ) {
        let heap = Heap::new(1 << 20).unwrap();
        let mut e = ChunkEntry::new_free();
        heap.malloc(&mut e, data.len() + pad as usize).unwrap();

        prop_assert_eq!(heap.write_bytes(e.address(), pad, &data), Some(data.len()));
        let mut out = vec![0u8; data.len()];
        prop_assert_eq!(heap.read_bytes(e.address(), pad, &mut out), Some(data.len()));
        prop_assert_eq!(out, data);
    }
}
