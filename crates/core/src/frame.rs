use smallvec::{SmallVec, smallvec};
use std::{
    num::NonZeroU32,
    sync::{Arc, Mutex},
};

use crate::{format::MediaFormat, metrics::Counters};

/// Metadata associated with a frame.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{ColorSpace, FourCc, FrameMeta, MediaFormat, Resolution};
///
/// let res = Resolution::new(640, 480).unwrap();
/// let fmt = MediaFormat::new(FourCc::new(*b"RG24"), res, ColorSpace::Srgb);
/// let meta = FrameMeta::new(fmt, 123, 7);
/// assert_eq!(meta.sequence, 7);
/// ```
#[derive(Debug, Clone)]
pub struct FrameMeta {
    /// Format describing layout and resolution.
    pub format: MediaFormat,
    /// Timestamp in nanoseconds, as reported by the driver.
    pub timestamp: u64,
    /// Driver-assigned frame sequence number.
    pub sequence: u64,
}

impl FrameMeta {
    /// Create metadata with the given format, timestamp and sequence number.
    pub fn new(format: MediaFormat, timestamp: u64, sequence: u64) -> Self {
        Self {
            format,
            timestamp,
            sequence,
        }
    }
}

/// Handle to a pooled byte buffer.
///
/// When dropped, the buffer is returned to the originating pool so the
/// consumer loop can copy driver planes without reallocating per frame.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::FramePool;
///
/// let pool = FramePool::with_capacity(2, 1024);
/// let mut lease = pool.lease();
/// lease.resize(16);
/// assert_eq!(lease.len(), 16);
/// ```
pub struct PoolLease {
    pool: Arc<PoolInner>,
    buf: Option<Vec<u8>>,
}

impl PoolLease {
    /// Borrow as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Borrow as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    /// Current length of the buffer.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ensure the buffer capacity fits `len` bytes and set its length.
    pub fn resize(&mut self, len: usize) {
        if let Some(buf) = self.buf.as_mut() {
            if buf.capacity() < len {
                buf.reserve(len - buf.capacity());
            }
            buf.resize(len, 0);
        }
    }

    fn take(mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

/// Pool that hands out reusable owned byte buffers for CPU frame copies.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::FramePool;
///
/// let pool = FramePool::with_limits(4, 1 << 20, 8);
/// let _lease = pool.lease();
/// ```
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Create a pool with `capacity` preallocated buffers of `chunk_size` bytes.
    pub fn with_capacity(capacity: usize, chunk_size: usize) -> Self {
        Self::with_limits(capacity, chunk_size, capacity)
    }

    /// Create a pool with `capacity` preallocated buffers and a maximum retained free list.
    pub fn with_limits(capacity: usize, chunk_size: usize, max_free: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(vec![0; chunk_size]);
        }
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                chunk_size,
                max_free,
                counters: Counters::default(),
            }),
        }
    }

    /// Acquire a buffer, allocating if the pool is empty.
    pub fn lease(&self) -> PoolLease {
        let buf = self
            .inner
            .free
            .lock()
            .unwrap()
            .pop()
            .inspect(|_| {
                self.inner.counters.hit();
            })
            .unwrap_or_else(|| {
                self.inner.counters.miss();
                self.inner.counters.alloc();
                vec![0; self.inner.chunk_size]
            });
        PoolLease {
            pool: self.inner.clone(),
            buf: Some(buf),
        }
    }

    /// Access counters for this pool.
    pub fn counters(&self) -> FramePoolCounters {
        FramePoolCounters(self.inner.clone())
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    chunk_size: usize,
    max_free: usize,
    counters: Counters,
}

impl PoolInner {
    fn recycle(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_free {
            free.push(buf);
        } else {
            self.counters.drop_item();
        }
    }
}

/// Observability for frame pool behavior.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::FramePool;
///
/// let pool = FramePool::with_capacity(1, 128);
/// let counters = pool.counters();
/// let _ = counters.hits();
/// ```
#[derive(Clone)]
pub struct FramePoolCounters(Arc<PoolInner>);

impl FramePoolCounters {
    pub fn hits(&self) -> u64 {
        self.0.counters.hits()
    }

    pub fn misses(&self) -> u64 {
        self.0.counters.misses()
    }

    pub fn allocations(&self) -> u64 {
        self.0.counters.allocations()
    }

    /// Buffers discarded on return because the free list was full.
    pub fn dropped(&self) -> u64 {
        self.0.counters.dropped()
    }
}

/// Plane view over a buffer.
///
/// Accessed via `Frame::planes`.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    data: &'a [u8],
    stride: usize,
}

/// Mutable plane view.
///
/// Accessed via `Frame::planes_mut`.
#[derive(Debug)]
pub struct PlaneMut<'a> {
    data: &'a mut [u8],
    stride: usize,
}

impl<'a> Plane<'a> {
    /// Access the raw bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Stride in bytes for this plane.
    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl<'a> PlaneMut<'a> {
    /// Mutable access to plane bytes.
    pub fn data(&mut self) -> &mut [u8] {
        self.data
    }

    /// Stride in bytes for this plane.
    pub fn stride(&self) -> usize {
        self.stride
    }
}

/// Plane layout information stored with a frame.
///
/// # Example
/// ```rust
/// use std::num::NonZeroU32;
/// use aperture_core::prelude::plane_layout_from_dims;
///
/// let layout = plane_layout_from_dims(
///     NonZeroU32::new(4).unwrap(),
///     NonZeroU32::new(4).unwrap(),
///     3,
/// );
/// assert_eq!(layout.stride, 12);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    /// Byte offset into the owning buffer.
    pub offset: usize,
    /// Length of the plane in bytes.
    pub len: usize,
    /// Stride in bytes.
    pub stride: usize,
}

/// Frame container holding one or more planes plus metadata.
///
/// Frames own their bytes; they are CPU copies made on the consumer thread so
/// the hardware buffers they came from can be recycled immediately.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::*;
///
/// let pool = FramePool::with_capacity(1, 256);
/// let res = Resolution::new(4, 4).unwrap();
/// let fmt = MediaFormat::new(FourCc::new(*b"RG24"), res, ColorSpace::Srgb);
/// let layout = plane_layout_from_dims(res.width, res.height, 3);
/// let meta = FrameMeta::new(fmt, 0, 0);
/// let frame = Frame::single_plane(meta, pool.lease(), layout.len, layout.stride);
/// assert_eq!(frame.planes().len(), 1);
/// ```
pub struct Frame {
    meta: FrameMeta,
    buffers: SmallVec<[PoolLease; 3]>,
    layouts: SmallVec<[PlaneLayout; 3]>,
}

impl Frame {
    /// Construct a single-plane frame using the provided buffer.
    pub fn single_plane(meta: FrameMeta, mut buffer: PoolLease, len: usize, stride: usize) -> Self {
        buffer.resize(len);
        Self {
            meta,
            layouts: smallvec![PlaneLayout {
                offset: 0,
                len,
                stride,
            }],
            buffers: smallvec![buffer],
        }
    }

    /// Construct a multi-plane frame from a list of buffers and layouts.
    pub fn multi_plane(
        meta: FrameMeta,
        buffers: SmallVec<[PoolLease; 3]>,
        layouts: SmallVec<[PlaneLayout; 3]>,
    ) -> Self {
        debug_assert_eq!(buffers.len(), layouts.len());
        Self {
            meta,
            buffers,
            layouts,
        }
    }

    /// Metadata describing this frame.
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Iterate planes as borrowed slices.
    pub fn planes(&self) -> SmallVec<[Plane<'_>; 3]> {
        self.layouts
            .iter()
            .zip(self.buffers.iter())
            .map(|(layout, buf)| {
                let slice = buf
                    .as_slice()
                    .get(layout.offset..layout.offset + layout.len)
                    .unwrap_or(&[]);
                Plane {
                    data: slice,
                    stride: layout.stride,
                }
            })
            .collect()
    }

    /// Iterate mutable planes for in-place writes.
    pub fn planes_mut(&mut self) -> SmallVec<[PlaneMut<'_>; 3]> {
        self.layouts
            .iter()
            .zip(self.buffers.iter_mut())
            .map(|(layout, buf)| {
                let len = layout.offset + layout.len;
                if buf.len() < len {
                    buf.resize(len);
                }
                let slice = buf
                    .as_mut_slice()
                    .get_mut(layout.offset..layout.offset + layout.len)
                    .unwrap_or(&mut []);
                PlaneMut {
                    data: slice,
                    stride: layout.stride,
                }
            })
            .collect()
    }

    /// Return a copy of plane layouts.
    pub fn layouts(&self) -> SmallVec<[PlaneLayout; 3]> {
        self.layouts.clone()
    }

    /// Convert into owned buffers and metadata.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        FrameMeta,
        SmallVec<[PlaneLayout; 3]>,
        SmallVec<[Vec<u8>; 3]>,
    ) {
        let layouts = self.layouts.clone();
        let buffers = self.buffers.into_iter().map(|lease| lease.take()).collect();
        (self.meta, layouts, buffers)
    }
}

/// Helper for building geometry consistently.
///
/// # Example
/// ```rust
/// use std::num::NonZeroU32;
/// use aperture_core::prelude::plane_layout_from_dims;
///
/// let layout = plane_layout_from_dims(
///     NonZeroU32::new(2).unwrap(),
///     NonZeroU32::new(3).unwrap(),
///     4,
/// );
/// assert_eq!(layout.len, 24);
/// ```
pub fn plane_layout_from_dims(
    width: NonZeroU32,
    height: NonZeroU32,
    bytes_per_pixel: usize,
) -> PlaneLayout {
    let stride = width.get() as usize * bytes_per_pixel;
    let len = stride * height.get() as usize;
    PlaneLayout {
        offset: 0,
        len,
        stride,
    }
}

/// Helper to construct a layout when stride is already known.
///
/// # Example
/// ```rust
/// use std::num::NonZeroU32;
/// use aperture_core::prelude::plane_layout_with_stride;
///
/// let layout = plane_layout_with_stride(NonZeroU32::new(3).unwrap(), 8);
/// assert_eq!(layout.len, 24);
/// ```
pub fn plane_layout_with_stride(height: NonZeroU32, stride: usize) -> PlaneLayout {
    let len = stride * height.get() as usize;
    PlaneLayout {
        offset: 0,
        len,
        stride,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ColorSpace, FourCc, Resolution};

    fn meta() -> FrameMeta {
        let res = Resolution::new(4, 2).unwrap();
        FrameMeta::new(
            MediaFormat::new(FourCc::new(*b"RG24"), res, ColorSpace::Srgb),
            0,
            0,
        )
    }

    #[test]
    fn pool_reuses_returned_buffers() {
        let pool = FramePool::with_capacity(1, 64);
        {
            let _lease = pool.lease();
        }
        let _lease = pool.lease();
        assert_eq!(pool.counters().hits(), 2);
        assert_eq!(pool.counters().allocations(), 0);
    }

    #[test]
    fn pool_allocates_when_exhausted() {
        let pool = FramePool::with_capacity(1, 64);
        let _a = pool.lease();
        let _b = pool.lease();
        assert_eq!(pool.counters().misses(), 1);
        assert_eq!(pool.counters().allocations(), 1);
    }

    #[test]
    fn pool_discards_past_the_free_limit() {
        let pool = FramePool::with_limits(1, 64, 1);
        let a = pool.lease();
        let b = pool.lease();
        drop(a);
        drop(b);
        assert_eq!(pool.counters().dropped(), 1);
        assert_eq!(pool.counters().allocations(), 1);
    }

    #[test]
    fn single_plane_frame_exposes_bytes() {
        let pool = FramePool::with_capacity(1, 64);
        let mut frame = Frame::single_plane(meta(), pool.lease(), 24, 12);
        frame.planes_mut()[0].data().fill(0xAB);
        let planes = frame.planes();
        assert_eq!(planes.len(), 1);
        assert_eq!(planes[0].stride(), 12);
        assert!(planes[0].data().iter().all(|&b| b == 0xAB));
    }
}
