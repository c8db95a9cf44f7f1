use std::time::Duration;

/// Default number of hardware buffers allocated per stream.
pub const DEFAULT_BUFFER_COUNT: usize = 4;
/// Default per-lane completion queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;
/// Default extra spare CPU frame buffers beyond the buffer count.
pub const DEFAULT_POOL_SPARE: usize = 8;
/// Default time to wait for in-flight requests while stopping.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 500;

/// Per-session tuning knobs.
///
/// Passed explicitly to each session rather than set process-wide, so two
/// sessions on different devices can be tuned independently.
///
/// # Example
/// ```rust
/// use aperture::prelude::SessionTunables;
///
/// let tunables = SessionTunables {
///     buffer_count: 6,
///     ..SessionTunables::default()
/// };
/// assert_eq!(tunables.sanitized().buffer_count, 6);
/// ```
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionTunables {
    /// Hardware buffers (and request slots) per stream.
    pub buffer_count: usize,
    /// Capacity of each completion queue lane.
    pub queue_depth: usize,
    /// Extra CPU frame buffers retained beyond `buffer_count`.
    pub pool_spare: usize,
    /// Milliseconds to wait for the driver to hand back buffers on stop.
    pub drain_timeout_ms: u64,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            pool_spare: DEFAULT_POOL_SPARE,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }
}

impl SessionTunables {
    /// Clamp values into ranges the session can actually run with.
    pub fn sanitized(self) -> Self {
        let buffer_count = self.buffer_count.clamp(2, 64);
        Self {
            buffer_count,
            queue_depth: self.queue_depth.max(buffer_count),
            pool_spare: self.pool_spare,
            drain_timeout_ms: self.drain_timeout_ms.max(50),
        }
    }

    pub(crate) fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
