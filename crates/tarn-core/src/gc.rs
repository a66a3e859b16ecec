//! Collector-facing bridge: references, read barriers, compaction pinning
//!
//! The walker and decoder never depend on a particular collector. Two
//! contracts are enough:
//!
//! - every reference decoded out of a frame passes through
//!   [`Heap::finalize_root_read`] before being returned, because a moving
//!   collector may have relocated the object since the frame stored it;
//! - a walk holds the heap's shared no-compaction guard for its duration,
//!   so objects cannot move mid-walk.
//!
//! For a non-moving collector both collapse to no-ops via
//! [`NonMovingBarrier`].

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Compressed reference to a heap object; zero is null
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(u32);

impl ObjectRef {
    /// The null reference
    #[inline]
    pub const fn null() -> Self {
        ObjectRef(0)
    }

    /// Build a reference from its compressed form
    #[inline]
    pub const fn from_u32(raw: u32) -> Self {
        ObjectRef(raw)
    }

    /// The compressed form
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this is the null reference
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Normalization step applied to every reference read out of a frame
///
/// A frame slot may hold the address an object had when the frame stored
/// it; the barrier returns where the object lives now.
pub trait ReadBarrier: Send + Sync {
    /// Normalize a root read; null always maps to null
    fn finalize_root_read(&self, reference: ObjectRef) -> ObjectRef;
}

/// Barrier for collectors that never move objects
#[derive(Debug, Default)]
pub struct NonMovingBarrier;

impl ReadBarrier for NonMovingBarrier {
    #[inline]
    fn finalize_root_read(&self, reference: ObjectRef) -> ObjectRef {
        reference
    }
}

/// Shared guard proving heap compaction is excluded
///
/// Held by every walker for the duration of its walk.
pub struct CompactionGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive guard held by the collector while it relocates objects
pub struct CompactionExclusiveGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// The heap as this subsystem sees it: a read barrier and a compaction lock
pub struct Heap {
    barrier: Box<dyn ReadBarrier>,
    compaction: RwLock<()>,
}

impl Heap {
    /// Create a heap bridge with the given read barrier
    pub fn new(barrier: Box<dyn ReadBarrier>) -> Self {
        Self {
            barrier,
            compaction: RwLock::new(()),
        }
    }

    /// Create a heap bridge for a non-moving collector
    pub fn non_moving() -> Self {
        Self::new(Box::new(NonMovingBarrier))
    }

    /// Normalize a reference read out of a frame
    #[inline]
    pub fn finalize_root_read(&self, reference: ObjectRef) -> ObjectRef {
        if reference.is_null() {
            return reference;
        }
        self.barrier.finalize_root_read(reference)
    }

    /// Exclude heap compaction for the guard's lifetime (shared)
    pub fn pin_compaction(&self) -> CompactionGuard<'_> {
        CompactionGuard {
            _guard: self.compaction.read(),
        }
    }

    /// Acquire the collector's exclusive compaction access
    pub fn begin_compaction(&self) -> CompactionExclusiveGuard<'_> {
        CompactionExclusiveGuard {
            _guard: self.compaction.write(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::non_moving()
    }
}
