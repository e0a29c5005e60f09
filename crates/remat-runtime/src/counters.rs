//! Process-wide accounting of produced physical memory.
//!
//! The counters live next to the producers rather than in the allocator so
//! that the reported figures track what the driver actually holds, cycle by
//! cycle, including memory that is currently released.

use std::sync::atomic::{AtomicU64, Ordering};

/// The accounting bucket of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterKind {
    /// Device-resident memory.
    Device,
    /// Page-locked host memory.
    Pinned,
}

#[derive(Debug)]
struct Bucket {
    current: AtomicU64,
    peak: AtomicU64,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    fn add(&self, size: u64) {
        let current = self.current.fetch_add(size, Ordering::Relaxed) + size;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    fn sub(&self, size: u64) {
        self.current.fetch_sub(size, Ordering::Relaxed);
    }
}

/// Current and peak byte counts per bucket.
#[derive(Debug)]
pub struct MemoryCounters {
    device: Bucket,
    pinned: Bucket,
}

impl MemoryCounters {
    /// A zeroed set of counters.
    pub const fn new() -> Self {
        Self {
            device: Bucket::new(),
            pinned: Bucket::new(),
        }
    }

    /// The process-wide instance producers report to.
    pub fn global() -> &'static MemoryCounters {
        static GLOBAL: MemoryCounters = MemoryCounters::new();
        &GLOBAL
    }

    fn bucket(&self, kind: CounterKind) -> &Bucket {
        match kind {
            CounterKind::Device => &self.device,
            CounterKind::Pinned => &self.pinned,
        }
    }

    /// Records `size` produced bytes.
    pub fn allocate(&self, kind: CounterKind, size: u64) {
        self.bucket(kind).add(size);
    }

    /// Records `size` disposed bytes.
    pub fn deallocate(&self, kind: CounterKind, size: u64) {
        self.bucket(kind).sub(size);
    }

    /// The bytes currently outstanding in a bucket.
    pub fn current(&self, kind: CounterKind) -> u64 {
        self.bucket(kind).current.load(Ordering::Relaxed)
    }

    /// The highest value [`MemoryCounters::current`] has reached.
    pub fn peak(&self, kind: CounterKind) -> u64 {
        self.bucket(kind).peak.load(Ordering::Relaxed)
    }
}

impl Default for MemoryCounters {
    fn default() -> Self {
        Self::new()
    }
}
