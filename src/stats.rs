//! Operation counters.
//!
//! The store records one event per top-level operation through an injected
//! counter interface. The core has no opinion about the implementation; the
//! default is a no-op and [`AtomicCounters`] is a plain relaxed-atomic
//! reference implementation for tools and tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Top-level store operations, as counted at their boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Op {
    /// Chunk creation.
    Create = 0,
    /// CID reservation.
    Reserve,
    /// Allocation for reserved CIDs.
    CreateReserved,
    /// Chunk read.
    Get,
    /// Chunk write.
    Put,
    /// Chunk resize.
    Resize,
    /// Chunk removal.
    Remove,
    /// Pin flag set.
    Pin,
    /// Pin flag cleared.
    Unpin,
}

const NUM_OPS: usize = 9;

const ALL_OPS: [Op; NUM_OPS] = [
    Op::Create,
    Op::Reserve,
    Op::CreateReserved,
    Op::Get,
    Op::Put,
    Op::Resize,
    Op::Remove,
    Op::Pin,
    Op::Unpin,
];

/// Counter sink invoked at operation boundaries.
pub trait OpCounters: Send + Sync {
    /// Record one occurrence of `op`.
    fn record(&self, op: Op);
}

/// Discards all events; the default when none is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCounters;

impl OpCounters for NoopCounters {
    #[inline]
    fn record(&self, _op: Op) {}
}

/// Relaxed per-operation counters.
#[derive(Default)]
pub struct AtomicCounters {
    counts: [AtomicU64; NUM_OPS],
}

impl AtomicCounters {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `op`.
    pub fn get(&self, op: Op) -> u64 {
        self.counts[op as usize].load(Ordering::Relaxed)
    }

    /// Sum over all operations.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

impl OpCounters for AtomicCounters {
    #[inline]
    fn record(&self, op: Op) {
        self.counts[op as usize].fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for AtomicCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("AtomicCounters");
        for op in ALL_OPS {
            s.field(&format!("{op:?}"), &self.get(op));
        }
        s.finish()
    }
}
