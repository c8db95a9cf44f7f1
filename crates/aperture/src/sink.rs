use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use aperture_core::prelude::Frame;

/// A frame as handed to the presentation sink.
pub struct DeliveredFrame {
    /// Owned CPU copy of the frame.
    pub frame: Frame,
    /// Driver sequence number.
    pub sequence: u64,
    /// Frames the driver skipped since the previous delivery (0 when none).
    pub sequence_gap: u64,
    /// Instantaneous rate derived from driver timestamps; 0.0 for the first
    /// frame of a session.
    pub fps: f64,
}

/// Receives every delivered viewfinder frame.
///
/// `present` runs on the consumer thread and is fire-and-forget: the session
/// recycles buffers and requeues the request no matter what the sink does,
/// so a slow sink stalls delivery but can never leak buffers.
pub trait FrameSink: Send + Sync {
    fn present(&self, frame: &DeliveredFrame);
}

/// Receives one-shot raw captures.
pub trait RawSink: Send + Sync {
    fn present_raw(&self, frame: &Frame);
}

/// Sink that discards frames; useful when only filter output matters.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&self, _frame: &DeliveredFrame) {}
}

/// Delivery metadata captured by [`CollectSink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRecord {
    pub sequence: u64,
    pub sequence_gap: u64,
    pub fps: f64,
    pub timestamp: u64,
}

/// Sink that records delivery metadata, for tests and diagnostics.
///
/// # Example
/// ```rust
/// use aperture::prelude::{CollectSink, FrameSink};
///
/// let sink = CollectSink::default();
/// assert_eq!(sink.len(), 0);
/// ```
#[derive(Default)]
pub struct CollectSink {
    records: Mutex<Vec<FrameRecord>>,
}

impl CollectSink {
    /// Number of frames presented so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether anything has been presented yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<FrameRecord> {
        self.records.lock().clone()
    }
}

impl FrameSink for CollectSink {
    fn present(&self, frame: &DeliveredFrame) {
        self.records.lock().push(FrameRecord {
            sequence: frame.sequence,
            sequence_gap: frame.sequence_gap,
            fps: frame.fps,
            timestamp: frame.frame.meta().timestamp,
        });
    }
}

/// Raw sink that counts captures and remembers the last frame's byte size.
#[derive(Default)]
pub struct CollectRawSink {
    count: AtomicUsize,
    last_len: AtomicUsize,
}

impl CollectRawSink {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn last_len(&self) -> usize {
        self.last_len.load(Ordering::Acquire)
    }
}

impl RawSink for CollectRawSink {
    fn present_raw(&self, frame: &Frame) {
        let len: usize = frame.planes().iter().map(|p| p.data().len()).sum();
        self.last_len.store(len, Ordering::Release);
        self.count.fetch_add(1, Ordering::Release);
    }
}
