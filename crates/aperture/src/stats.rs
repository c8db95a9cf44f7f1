use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

const FPS_WINDOW: usize = 30;

/// Shared session counters; cheap to clone, all methods lock-free except the
/// rolling fps window.
///
/// # Example
/// ```rust
/// use aperture::prelude::SessionStats;
///
/// let stats = SessionStats::default();
/// assert_eq!(stats.frames(), 0);
/// assert_eq!(stats.last_fps(), 0.0);
/// ```
#[derive(Clone, Default)]
pub struct SessionStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    frames: AtomicU64,
    skipped_cycles: AtomicU64,
    analysis_drops: AtomicU64,
    filter_panics: AtomicU64,
    sequence_gaps: AtomicU64,
    last_fps_bits: AtomicU64,
    fps_window: Mutex<VecDeque<f64>>,
}

impl SessionStats {
    pub(crate) fn record_frame(&self, fps: f64) {
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_fps_bits
            .store(fps.to_bits(), Ordering::Relaxed);
        if fps > 0.0 {
            let mut window = self.inner.fps_window.lock();
            if window.len() == FPS_WINDOW {
                window.pop_front();
            }
            window.push_back(fps);
        }
    }

    pub(crate) fn record_skipped_cycle(&self) {
        self.inner.skipped_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_analysis_drop(&self) {
        self.inner.analysis_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filter_panic(&self) {
        self.inner.filter_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sequence_gap(&self, gap: u64) {
        self.inner.sequence_gaps.fetch_add(gap, Ordering::Relaxed);
    }

    /// Frames delivered to the sink since the session was created.
    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    /// Completions that could not be requeued because the pool was empty.
    pub fn skipped_cycles(&self) -> u64 {
        self.inner.skipped_cycles.load(Ordering::Relaxed)
    }

    /// Frames that skipped analysis because a filter run was in flight.
    pub fn analysis_drops(&self) -> u64 {
        self.inner.analysis_drops.load(Ordering::Relaxed)
    }

    /// Filter invocations that panicked and were isolated.
    pub fn filter_panics(&self) -> u64 {
        self.inner.filter_panics.load(Ordering::Relaxed)
    }

    /// Total frames the driver skipped, summed over all gaps.
    pub fn sequence_gaps(&self) -> u64 {
        self.inner.sequence_gaps.load(Ordering::Relaxed)
    }

    /// Instantaneous fps of the most recent frame; 0.0 before the second
    /// frame of a session.
    pub fn last_fps(&self) -> f64 {
        f64::from_bits(self.inner.last_fps_bits.load(Ordering::Relaxed))
    }

    /// Mean fps over the last few dozen frames.
    pub fn rolling_fps(&self) -> f64 {
        let window = self.inner.fps_window.lock();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }
}
