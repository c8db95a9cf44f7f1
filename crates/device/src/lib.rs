#![doc = include_str!("../README.md")]

use smallvec::SmallVec;
use std::{fmt, sync::Arc};

use aperture_core::prelude::{FourCc, MediaFormat, Resolution};

pub mod pool;
pub mod virtual_device;

use crate::pool::BufferTicket;

/// Identifier of a stream exposed by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Role a stream plays in a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Continuous preview stream.
    Viewfinder,
    /// High-resolution still capture.
    StillCapture,
    /// Unprocessed sensor data.
    Raw,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamRole::Viewfinder => "viewfinder",
            StreamRole::StillCapture => "still",
            StreamRole::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// Where a camera is mounted, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceLocation {
    /// User-facing camera.
    Front,
    /// World-facing camera.
    Back,
    /// External camera (USB or network attached).
    External,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceLocation::Front => "Internal front camera",
            DeviceLocation::Back => "Internal back camera",
            DeviceLocation::External => "External camera",
            DeviceLocation::Unknown => "Unknown location",
        };
        f.write_str(name)
    }
}

/// A pixel format together with the frame sizes the device supports for it.
#[derive(Debug, Clone)]
pub struct FormatRange {
    /// Pixel format code.
    pub code: FourCc,
    /// Supported frame sizes, ordered smallest to largest.
    pub sizes: Vec<Resolution>,
}

/// One stream a device can produce.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Stable id used to address the stream in requests.
    pub id: StreamId,
    /// Role this stream serves.
    pub role: StreamRole,
    /// Formats the stream supports.
    pub formats: Vec<FormatRange>,
}

/// Static description of a camera device.
///
/// # Example
/// ```rust
/// use aperture_device::CameraDevice;
/// use aperture_device::virtual_device::VirtualDevice;
///
/// let (device, _handle) = VirtualDevice::with_defaults();
/// assert!(!device.descriptor().streams.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Unique device id (driver node, serial, ...).
    pub id: String,
    /// Human-readable model name.
    pub model: String,
    /// Mount location.
    pub location: DeviceLocation,
    /// Streams the device exposes.
    pub streams: Vec<StreamDescriptor>,
}

impl DeviceDescriptor {
    /// Find a stream by role.
    pub fn stream_for_role(&self, role: StreamRole) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.role == role)
    }
}

/// Negotiated geometry for one stream, as accepted by `CameraDevice::apply`.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    /// Stream this layout applies to.
    pub stream: StreamId,
    /// Accepted format and resolution.
    pub format: MediaFormat,
    /// Row stride in bytes for the first plane.
    pub stride: usize,
}

impl StreamLayout {
    /// Total bytes of one frame on this stream (single plane geometry).
    pub fn frame_len(&self) -> usize {
        self.stride * self.format.resolution.height.get() as usize
    }
}

/// Packed bytes-per-pixel for the formats the stack negotiates.
pub fn bytes_per_pixel(code: FourCc) -> usize {
    match code.as_str() {
        Some("RG24") | Some("BG24") => 3,
        Some("YUYV") | Some("UYVY") => 2,
        Some("XR24") | Some("AR24") => 4,
        Some("GREY") | Some("BA81") => 1,
        _ => 4,
    }
}

/// Identifier of a capture request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub usize);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// A capture request handed to the driver.
///
/// The request owns the buffer tickets for every stream it touches; they come
/// back inside the matching [`CompletedRequest`].
pub struct DriverRequest {
    /// Slot id; the session reuses a fixed set of ids.
    pub id: RequestId,
    /// One ticket per stream this request fills.
    pub buffers: SmallVec<[(StreamId, BufferTicket); 2]>,
}

/// Why a request came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Buffers were filled; metadata is valid.
    Success,
    /// Request was cancelled during teardown; buffer contents are undefined.
    Cancelled,
}

/// A finished request as delivered to the completion handler.
pub struct CompletedRequest {
    /// The originating request, tickets included.
    pub request: DriverRequest,
    /// Success or cancellation.
    pub status: CompletionStatus,
    /// Driver frame sequence number; meaningless for cancelled requests.
    pub sequence: u64,
    /// Capture timestamp in nanoseconds; meaningless for cancelled requests.
    pub timestamp: u64,
    /// Bytes actually written per plane of the primary buffer.
    pub bytes_used: SmallVec<[usize; 4]>,
}

/// Callback invoked by the driver thread for every finished request.
///
/// Implementations must stay O(1) and allocation-free: they run in driver
/// context where blocking stalls the capture pipeline.
pub type CompletionHandler = Arc<dyn Fn(CompletedRequest) + Send + Sync>;

/// CPU-visible mapping of a hardware buffer.
pub trait BufferMapping: Send + Sync {
    /// Number of mapped planes.
    fn plane_count(&self) -> usize;

    /// Borrow a plane by index; lifetime tied to `self`.
    fn plane(&self, index: usize) -> Option<&[u8]>;
}

/// A driver-allocated buffer plus its CPU mapping.
pub struct HardwareBuffer {
    mapping: Arc<dyn BufferMapping>,
}

impl HardwareBuffer {
    /// Wrap a mapping produced by a driver.
    pub fn new(mapping: Arc<dyn BufferMapping>) -> Self {
        Self { mapping }
    }

    /// The CPU mapping for this buffer.
    pub fn mapping(&self) -> &Arc<dyn BufferMapping> {
        &self.mapping
    }
}

/// Errors surfaced by device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device is already in use")]
    Busy,
    #[error("device disconnected")]
    Disconnected,
    #[error("device rejected configuration: {0}")]
    Configuration(String),
    #[error("driver error: {0}")]
    Driver(String),
}

impl DeviceError {
    /// Short machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::Busy => "busy",
            DeviceError::Disconnected => "disconnected",
            DeviceError::Configuration(_) => "configuration",
            DeviceError::Driver(_) => "driver",
        }
    }

    /// Whether retrying the same call later can reasonably succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, DeviceError::Busy)
    }
}

/// Buffer allocation failure for one stream.
#[derive(Debug, thiserror::Error)]
#[error("cannot allocate {requested} buffers for {stream}: {reason}")]
pub struct AllocationError {
    pub stream: StreamId,
    pub requested: usize,
    pub reason: String,
}

/// Driver-side contract for a camera.
///
/// The session layer calls these in a strict order: `acquire`, `apply`,
/// `allocate_buffers`, `set_completion_handler`, then `submit` repeatedly,
/// and finally `cancel_all` and `release`. Implementations invoke the
/// completion handler exactly once per submitted request, from whatever
/// thread the driver completes on.
pub trait CameraDevice: Send {
    /// Static description of the device.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Take exclusive ownership of the device.
    fn acquire(&mut self) -> Result<(), DeviceError>;

    /// Push a negotiated configuration down to the driver.
    fn apply(&mut self, layouts: &[StreamLayout]) -> Result<(), DeviceError>;

    /// Allocate and map `count` buffers for one stream.
    fn allocate_buffers(
        &mut self,
        stream: StreamId,
        count: usize,
    ) -> Result<Vec<HardwareBuffer>, AllocationError>;

    /// Install the callback invoked for every completed request.
    fn set_completion_handler(&mut self, handler: CompletionHandler);

    /// Queue a request to the driver.
    fn submit(&mut self, request: DriverRequest) -> Result<(), DeviceError>;

    /// Synchronously complete every in-flight request as `Cancelled`.
    fn cancel_all(&mut self);

    /// Give up ownership; safe to call again after a failed start.
    fn release(&mut self);
}

pub mod prelude {
    pub use crate::{
        AllocationError, BufferMapping, CameraDevice, CompletedRequest, CompletionHandler,
        CompletionStatus, DeviceDescriptor, DeviceError, DeviceLocation, DriverRequest,
        FormatRange, HardwareBuffer, RequestId, StreamDescriptor, StreamId, StreamLayout,
        StreamRole, bytes_per_pixel,
        pool::{BufferPool, BufferTicket},
        virtual_device::{VirtualDevice, VirtualHandle},
    };
}
