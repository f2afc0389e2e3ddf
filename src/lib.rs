//! # Chunkstore
//!
//! An embeddable off-heap key/value memory manager: 64-bit chunk ids (CIDs)
//! map to variable-sized, contiguously allocated byte chunks inside one
//! large pre-reserved memory region. Designed as the storage tier of a
//! distributed in-memory system: many application threads run gets and puts
//! concurrently while a background defragmenter compacts the heap.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         ChunkStore                              │
//! │   create / reserve / get / put / resize / remove / pin          │
//! ├───────────────┬───────────────────────────┬─────────────────────┤
//! │  DefragGate   │         CidTable          │     lock protocol   │
//! │ (app threads  │  CID ─radix─> entry word  │  readers/writer in  │
//! │  vs compactor)│  CAS on 64-bit slots      │  the entry word     │
//! ├───────────────┴───────────────────────────┴─────────────────────┤
//! │                           Heap                                  │
//! │   mmap region · boundary-tag free lists · typed payload I/O     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each chunk is described by a single 64-bit entry word in a leaf of the
//! CID table, packing the payload address, a length field (embedded for
//! chunks up to 2047 bytes, otherwise split with an overflow prefix in the
//! heap), a pin flag, and the chunk's reader/writer lock. Every state
//! transition is a compare-and-swap on that word.
//!
//! ## Example
//!
//! ```rust,ignore
//! use chunkstore::{ChunkStore, LockTimeout, StoreConfig};
//!
//! let store = ChunkStore::new(StoreConfig::builder().heap_capacity(1 << 30).build()?)?;
//!
//! let cid = store.create(128)?;
//! store.put(cid, &[0x41; 128], LockTimeout::Infinite)?;
//!
//! let mut buf = [0u8; 128];
//! store.get(cid, &mut buf, LockTimeout::Millis(100))?;
//! ```
//!
//! ## Guarantees
//!
//! - Read-after-write consistency per CID: a reader that acquires the chunk
//!   lock sees the bytes of the last writer that released it.
//! - Concurrent writers to one CID serialize; payloads are never torn.
//! - Pinned chunks keep their address across defragmentation passes.
//! - Removed CIDs are not re-issued before zombie cleanup.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cid;
pub mod config;
pub mod defrag;
pub mod entry;
pub mod error;
pub mod heap;
pub mod imexport;
pub mod lock;
pub mod stats;
pub mod store;
pub mod table;

// Re-exports
pub use cid::ChunkId;
pub use config::{ConfigError, StoreConfig, StoreConfigBuilder};
pub use defrag::{CompactionSummary, DefragGate};
pub use entry::ChunkEntry;
pub use error::{Error, Result};
pub use heap::{Heap, HeapStatus};
pub use imexport::{BufferImExporter, Exporter, HeapImExporter, Importer};
pub use lock::{LockStatus, LockTimeout};
pub use stats::{AtomicCounters, NoopCounters, Op, OpCounters};
pub use store::ChunkStore;
pub use table::CidTable;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
