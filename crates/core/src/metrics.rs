use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for pool and queue behavior.
///
/// # Example
/// ```rust
/// use aperture_core::metrics::Counters;
///
/// let counters = Counters::default();
/// counters.hit();
/// assert_eq!(counters.hits(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    /// Increment hit counter.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment miss counter.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment allocation counter.
    pub fn alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment dropped-item counter.
    pub fn drop_item(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Snapshot of misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Snapshot of allocations.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Snapshot of dropped items.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Clone for Counters {
    fn clone(&self) -> Self {
        let cloned = Counters::default();
        cloned.hits.store(self.hits(), Ordering::Relaxed);
        cloned.misses.store(self.misses(), Ordering::Relaxed);
        cloned
            .allocations
            .store(self.allocations(), Ordering::Relaxed);
        cloned.dropped.store(self.dropped(), Ordering::Relaxed);
        cloned
    }
}
