use std::sync::Arc;

use crate::{AllocationError, BufferMapping, CameraDevice, HardwareBuffer, StreamId};

/// Move-only handle to one buffer in a [`BufferPool`].
///
/// A ticket is either in its pool's free list, held by a request in flight,
/// or briefly held by the consumer loop between completion and release.
/// Because tickets cannot be cloned, releasing the same buffer twice is not
/// expressible.
#[derive(Debug)]
pub struct BufferTicket {
    index: usize,
    stream: StreamId,
}

impl BufferTicket {
    /// Index of the backing buffer within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Stream this ticket's pool serves.
    pub fn stream(&self) -> StreamId {
        self.stream
    }
}

/// Fixed set of hardware buffers for one stream.
///
/// Buffers are allocated once at start through the device and freed together
/// at teardown; between those points they only circulate as tickets.
///
/// # Example
/// ```rust
/// use aperture_device::prelude::*;
///
/// let (mut device, _handle) = VirtualDevice::with_defaults();
/// let stream = device.descriptor().streams[0].id;
/// let format = device.descriptor().streams[0].formats[0].clone();
/// let layout = StreamLayout {
///     stream,
///     format: aperture_core::prelude::MediaFormat::new(
///         format.code,
///         format.sizes[0],
///         aperture_core::prelude::ColorSpace::Srgb,
///     ),
///     stride: format.sizes[0].width.get() as usize * bytes_per_pixel(format.code),
/// };
/// device.acquire().unwrap();
/// device.apply(std::slice::from_ref(&layout)).unwrap();
/// let mut pool = BufferPool::allocate(&mut device, stream, 4).unwrap();
/// assert_eq!(pool.free_count(), 4);
/// let ticket = pool.acquire().unwrap();
/// pool.release(ticket);
/// ```
pub struct BufferPool {
    stream: StreamId,
    buffers: Vec<HardwareBuffer>,
    free: Vec<BufferTicket>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stream", &self.stream)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Allocate `count` buffers for `stream` through the device.
    pub fn allocate(
        device: &mut dyn CameraDevice,
        stream: StreamId,
        count: usize,
    ) -> Result<Self, AllocationError> {
        if count == 0 {
            return Err(AllocationError {
                stream,
                requested: 0,
                reason: "buffer count must be non-zero".into(),
            });
        }
        let buffers = device.allocate_buffers(stream, count)?;
        let free = (0..buffers.len())
            .rev()
            .map(|index| BufferTicket { index, stream })
            .collect();
        Ok(Self {
            stream,
            buffers,
            free,
        })
    }

    /// Stream this pool serves.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Total number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Buffers currently available for new requests.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Take a free buffer, or `None` when every buffer is in flight.
    pub fn acquire(&mut self) -> Option<BufferTicket> {
        self.free.pop()
    }

    /// Return a ticket to the free list.
    pub fn release(&mut self, ticket: BufferTicket) {
        debug_assert_eq!(ticket.stream, self.stream);
        debug_assert!(ticket.index < self.buffers.len());
        self.free.push(ticket);
    }

    /// CPU mapping of the buffer a ticket refers to.
    pub fn mapping(&self, ticket: &BufferTicket) -> &Arc<dyn BufferMapping> {
        self.buffers[ticket.index].mapping()
    }

    /// Drop every buffer. Consumes the pool so no ticket can outlive it
    /// through this handle.
    pub fn teardown(self) {
        drop(self);
    }
}
