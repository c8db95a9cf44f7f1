//! In-process camera device used by tests and demos.
//!
//! Completions are driven explicitly through [`VirtualHandle::complete_next`]
//! or continuously by [`VirtualHandle::spawn_clock`], so ordering-sensitive
//! scenarios stay deterministic.

use parking_lot::Mutex;
use smallvec::smallvec;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use aperture_core::prelude::{FourCc, Resolution};

use crate::{
    AllocationError, BufferMapping, CameraDevice, CompletedRequest, CompletionHandler,
    CompletionStatus, DeviceDescriptor, DeviceError, DeviceLocation, DriverRequest, FormatRange,
    HardwareBuffer, StreamDescriptor, StreamId, StreamLayout, StreamRole,
};

struct VirtualState {
    parked: Mutex<VecDeque<DriverRequest>>,
    handler: Mutex<Option<CompletionHandler>>,
    layouts: Mutex<Vec<StreamLayout>>,
    sequence: AtomicU64,
    acquired: AtomicBool,
    fail_submissions: AtomicBool,
    fail_allocations: AtomicBool,
}

impl VirtualState {
    fn complete_one(&self, timestamp: u64) -> bool {
        let Some(request) = self.parked.lock().pop_front() else {
            return false;
        };
        let Some(handler) = self.handler.lock().clone() else {
            self.parked.lock().push_front(request);
            return false;
        };
        let bytes_used = {
            let layouts = self.layouts.lock();
            let primary = request.buffers.first().map(|(stream, _)| *stream);
            let len = primary
                .and_then(|stream| layouts.iter().find(|l| l.stream == stream))
                .map(|l| l.frame_len())
                .unwrap_or(0);
            smallvec![len]
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        handler(CompletedRequest {
            request,
            status: CompletionStatus::Success,
            sequence,
            timestamp,
            bytes_used,
        });
        true
    }

    fn cancel_all(&self) {
        let drained: Vec<DriverRequest> = self.parked.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        let Some(handler) = self.handler.lock().clone() else {
            return;
        };
        for request in drained {
            handler(CompletedRequest {
                request,
                status: CompletionStatus::Cancelled,
                sequence: 0,
                timestamp: 0,
                bytes_used: smallvec![],
            });
        }
    }
}

/// Synthetic camera that parks submitted requests until completed by hand.
pub struct VirtualDevice {
    descriptor: DeviceDescriptor,
    state: Arc<VirtualState>,
}

impl VirtualDevice {
    /// Build a device with an explicit descriptor.
    pub fn new(descriptor: DeviceDescriptor) -> (Self, VirtualHandle) {
        let state = Arc::new(VirtualState {
            parked: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
            layouts: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            acquired: AtomicBool::new(false),
            fail_submissions: AtomicBool::new(false),
            fail_allocations: AtomicBool::new(false),
        });
        let handle = VirtualHandle {
            state: state.clone(),
        };
        (Self { descriptor, state }, handle)
    }

    /// Build a device advertising a typical viewfinder plus a raw stream.
    pub fn with_defaults() -> (Self, VirtualHandle) {
        Self::new(default_descriptor())
    }
}

fn res(width: u32, height: u32) -> Resolution {
    Resolution::new(width, height).expect("non-zero literal")
}

fn default_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        id: "virtual0".into(),
        model: "Aperture Virtual Sensor".into(),
        location: DeviceLocation::External,
        streams: vec![
            StreamDescriptor {
                id: StreamId(0),
                role: StreamRole::Viewfinder,
                formats: vec![
                    FormatRange {
                        code: FourCc::new(*b"RG24"),
                        sizes: vec![res(640, 480), res(1280, 720), res(1920, 1080)],
                    },
                    FormatRange {
                        code: FourCc::new(*b"YUYV"),
                        sizes: vec![res(640, 480), res(1280, 720)],
                    },
                ],
            },
            StreamDescriptor {
                id: StreamId(1),
                role: StreamRole::Raw,
                formats: vec![FormatRange {
                    code: FourCc::new(*b"BA81"),
                    sizes: vec![res(1920, 1080)],
                }],
            },
        ],
    }
}

struct PatternMapping {
    data: Vec<u8>,
}

impl BufferMapping for PatternMapping {
    fn plane_count(&self) -> usize {
        1
    }

    fn plane(&self, index: usize) -> Option<&[u8]> {
        (index == 0).then_some(self.data.as_slice())
    }
}

impl CameraDevice for VirtualDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn acquire(&mut self) -> Result<(), DeviceError> {
        if self
            .state
            .acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::Busy);
        }
        Ok(())
    }

    fn apply(&mut self, layouts: &[StreamLayout]) -> Result<(), DeviceError> {
        if !self.state.acquired.load(Ordering::Acquire) {
            return Err(DeviceError::Driver("device not acquired".into()));
        }
        for layout in layouts {
            if !self.descriptor.streams.iter().any(|s| s.id == layout.stream) {
                return Err(DeviceError::Configuration(format!(
                    "unknown {}",
                    layout.stream
                )));
            }
        }
        *self.state.layouts.lock() = layouts.to_vec();
        Ok(())
    }

    fn allocate_buffers(
        &mut self,
        stream: StreamId,
        count: usize,
    ) -> Result<Vec<HardwareBuffer>, AllocationError> {
        if self.state.fail_allocations.load(Ordering::Acquire) {
            return Err(AllocationError {
                stream,
                requested: count,
                reason: "injected allocation failure".into(),
            });
        }
        let len = {
            let layouts = self.state.layouts.lock();
            layouts
                .iter()
                .find(|l| l.stream == stream)
                .map(|l| l.frame_len())
                .ok_or_else(|| AllocationError {
                    stream,
                    requested: count,
                    reason: "stream not configured".into(),
                })?
        };
        Ok((0..count)
            .map(|i| {
                HardwareBuffer::new(Arc::new(PatternMapping {
                    data: vec![(i % 251) as u8; len],
                }))
            })
            .collect())
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        *self.state.handler.lock() = Some(handler);
    }

    fn submit(&mut self, request: DriverRequest) -> Result<(), DeviceError> {
        if !self.state.acquired.load(Ordering::Acquire) {
            return Err(DeviceError::Driver("device not acquired".into()));
        }
        if self.state.fail_submissions.load(Ordering::Acquire) {
            return Err(DeviceError::Disconnected);
        }
        self.state.parked.lock().push_back(request);
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.state.cancel_all();
    }

    fn release(&mut self) {
        self.state.layouts.lock().clear();
        // Any requests still parked were abandoned by a crashed consumer;
        // drop them with the device.
        self.state.parked.lock().clear();
        self.state.acquired.store(false, Ordering::Release);
    }
}

/// Control handle that outlives the device after it moves into a session.
#[derive(Clone)]
pub struct VirtualHandle {
    state: Arc<VirtualState>,
}

impl VirtualHandle {
    /// Complete the oldest parked request with the given timestamp.
    /// Returns false when nothing is parked or no handler is installed.
    pub fn complete_next(&self, timestamp: u64) -> bool {
        self.state.complete_one(timestamp)
    }

    /// Number of requests currently parked in the driver.
    pub fn pending(&self) -> usize {
        self.state.parked.lock().len()
    }

    /// Make subsequent `submit` calls fail as if the device vanished.
    pub fn inject_submit_failure(&self, fail: bool) {
        self.state.fail_submissions.store(fail, Ordering::Release);
    }

    /// Make subsequent buffer allocations fail.
    pub fn inject_allocation_failure(&self, fail: bool) {
        self.state.fail_allocations.store(fail, Ordering::Release);
    }

    /// Drive completions from a background thread at a fixed period.
    pub fn spawn_clock(&self, period: Duration) -> VirtualClock {
        let state = self.state.clone();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("virtual-clock".into())
            .spawn(move || {
                let base = Instant::now();
                loop {
                    match stop_rx.recv_timeout(period) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            // +1 keeps the first timestamp distinguishable
                            // from the "no previous frame" sentinel.
                            state.complete_one(base.elapsed().as_nanos() as u64 + 1);
                        }
                    }
                }
            })
            .expect("spawn virtual clock");
        VirtualClock {
            stop: stop_tx,
            thread: Some(thread),
        }
    }
}

/// Guard for the clock thread; stops and joins on drop.
pub struct VirtualClock {
    stop: mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for VirtualClock {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
