use parking_lot::{Condvar, Mutex};
use smallvec::{SmallVec, smallvec};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use aperture_core::prelude::{
    CompletionQueue, Frame, FrameMeta, FramePool, PlaneLayout, PoolLease, RecvOutcome, SendOutcome,
};
use aperture_device::{
    AllocationError, BufferMapping, CameraDevice, CompletedRequest, CompletionHandler,
    CompletionStatus, DeviceDescriptor, DeviceError, DriverRequest, RequestId, StreamId,
    StreamLayout, StreamRole,
    pool::{BufferPool, BufferTicket},
};

use crate::{
    config::{self, ConfigError, ConfigReport, ConfigStatus, StreamSpec},
    dispatch::{DispatchOutcome, FilterDispatcher, FilterReport},
    filter::FilterChain,
    ledger::{LedgerError, RequestLedger, RequestState},
    registry::RegistryClaim,
    sink::{DeliveredFrame, FrameSink, RawSink},
    stats::SessionStats,
    tunables::SessionTunables,
};

/// How often the consumer loop wakes to check for stop when idle.
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Why a session failed to start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("session is already running")]
    AlreadyRunning,
    #[error("configure must succeed before start")]
    NotConfigured,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Condvar-based wakeup for the consumer thread. `notify` is O(1) and
/// allocation-free so the driver's completion context can call it.
#[derive(Default)]
struct Wakeup {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock();
        if !*flag {
            let _ = self.cond.wait_for(&mut flag, timeout);
        }
        *flag = false;
    }
}

struct Runtime {
    stop_tx: mpsc::Sender<()>,
    wake: Arc<Wakeup>,
    worker: thread::JoinHandle<()>,
}

/// Orchestrates one camera from configuration to teardown.
///
/// The lifecycle is strict: [`configure`](Self::configure), then
/// [`start`](Self::start), then [`stop`](Self::stop). `stop` is idempotent
/// and always safe, including after a failed start; after `stop` the session
/// can be reconfigured and started again.
///
/// While running, a consumer thread drains completed requests from the
/// driver, copies frames out of hardware buffers, presents them to the
/// [`FrameSink`], offers them to the filter chain, and requeues the request
/// slot with a fresh buffer.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use aperture::prelude::*;
///
/// let (device, handle) = VirtualDevice::with_defaults();
/// let sink = Arc::new(CollectSink::default());
/// let mut session = CaptureSession::new(Box::new(device), sink.clone());
/// session.configure(&[StreamSpec::viewfinder()]).unwrap();
/// session.start().unwrap();
/// handle.complete_next(1_000_000);
/// session.stop();
/// ```
pub struct CaptureSession {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    descriptor: DeviceDescriptor,
    sink: Arc<dyn FrameSink>,
    raw_sink: Option<Arc<dyn RawSink>>,
    chain: FilterChain,
    dispatcher: Arc<FilterDispatcher>,
    tunables: SessionTunables,
    report: Option<ConfigReport>,
    stats: SessionStats,
    capture_raw: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    runtime: Option<Runtime>,
    claim: Option<RegistryClaim>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Create a session with default tunables.
    pub fn new(device: Box<dyn CameraDevice>, sink: Arc<dyn FrameSink>) -> Self {
        Self::with_tunables(device, sink, SessionTunables::default())
    }

    /// Create a session with explicit tunables.
    pub fn with_tunables(
        device: Box<dyn CameraDevice>,
        sink: Arc<dyn FrameSink>,
        tunables: SessionTunables,
    ) -> Self {
        let tunables = tunables.sanitized();
        let descriptor = device.descriptor().clone();
        let chain = FilterChain::default();
        let stats = SessionStats::default();
        let dispatcher = Arc::new(FilterDispatcher::new(
            chain.clone(),
            tunables.queue_depth,
            stats.clone(),
        ));
        Self {
            device: Arc::new(Mutex::new(device)),
            descriptor,
            sink,
            raw_sink: None,
            chain,
            dispatcher,
            tunables,
            report: None,
            stats,
            capture_raw: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            runtime: None,
            claim: None,
        }
    }

    pub(crate) fn attach_claim(&mut self, claim: RegistryClaim) {
        self.claim = Some(claim);
    }

    /// Static description of the underlying device.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Pixel formats advertised for a role.
    pub fn formats(&self, role: StreamRole) -> Vec<aperture_core::prelude::FourCc> {
        self.descriptor
            .stream_for_role(role)
            .map(|s| s.formats.iter().map(|r| r.code).collect())
            .unwrap_or_default()
    }

    /// Frame sizes advertised for a role and format.
    pub fn sizes(
        &self,
        role: StreamRole,
        code: aperture_core::prelude::FourCc,
    ) -> Vec<aperture_core::prelude::Resolution> {
        self.descriptor
            .stream_for_role(role)
            .and_then(|s| s.formats.iter().find(|r| r.code == code))
            .map(|r| r.sizes.clone())
            .unwrap_or_default()
    }

    /// The filter chain; add or remove filters at any time.
    pub fn filters(&self) -> &FilterChain {
        &self.chain
    }

    /// Shared counters for this session.
    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    /// Receiver for filter reports.
    pub fn filter_reports(&self) -> aperture_core::prelude::BoundedRx<FilterReport> {
        self.dispatcher.reports()
    }

    /// Install the sink for one-shot raw captures. Must be set before start.
    pub fn set_raw_sink(&mut self, sink: Arc<dyn RawSink>) {
        self.raw_sink = Some(sink);
    }

    /// The negotiated configuration, if `configure` has succeeded.
    pub fn config_report(&self) -> Option<&ConfigReport> {
        self.report.as_ref()
    }

    /// Whether the consumer loop is alive.
    pub fn is_running(&self) -> bool {
        self.runtime.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Negotiate stream configuration against the device descriptor.
    ///
    /// Adjustments are reported, not hidden: the returned status says exactly
    /// which fields moved. Unsatisfiable requests fail and leave any previous
    /// configuration in place.
    pub fn configure(&mut self, specs: &[StreamSpec]) -> Result<ConfigStatus, ConfigError> {
        if self.runtime.is_some() {
            return Err(ConfigError::SessionRunning);
        }
        let report = config::negotiate(&self.descriptor, specs)?;
        let status = report.status();
        match &status {
            ConfigStatus::Exact => debug!(streams = report.outcomes().len(), "configured"),
            ConfigStatus::Adjusted(adjustments) => {
                warn!(?adjustments, "configuration adjusted to device limits");
            }
        }
        self.report = Some(report);
        Ok(status)
    }

    /// Arm a one-shot raw capture: the next requeued request also carries a
    /// raw-stream buffer. Returns false when no raw stream is configured or
    /// the session is not running.
    pub fn arm_raw_capture(&self) -> bool {
        let has_raw = self
            .report
            .as_ref()
            .and_then(|r| r.layout_for_role(StreamRole::Raw))
            .is_some();
        if !has_raw || !self.is_running() {
            return false;
        }
        self.capture_raw.store(true, Ordering::Release);
        true
    }

    /// Acquire the device, allocate buffers, prime the request slots and
    /// spawn the consumer loop.
    ///
    /// Any failure rolls everything back: buffers freed, device released,
    /// session back in the configured state.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.runtime.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        let report = self.report.clone().ok_or(StartError::NotConfigured)?;
        let layouts = report.layouts();
        let tunables = self.tunables;

        let mut device = self.device.lock();
        device.acquire()?;
        if let Err(err) = device.apply(&layouts) {
            device.release();
            return Err(err.into());
        }

        let mut pools: Vec<BufferPool> = Vec::with_capacity(layouts.len());
        for layout in &layouts {
            match BufferPool::allocate(&mut **device, layout.stream, tunables.buffer_count) {
                Ok(pool) => pools.push(pool),
                Err(err) => {
                    pools.clear();
                    device.release();
                    return Err(err.into());
                }
            }
        }

        let slot_count = tunables.buffer_count;
        let ledger = Arc::new(RequestLedger::new(slot_count));
        let queue = Arc::new(CompletionQueue::<CompletedRequest>::new(
            tunables.queue_depth,
        ));
        let wake = Arc::new(Wakeup::default());

        // Driver-context callback: one compare-exchange, one lock-free push,
        // one condvar notify. No allocation, no logging, no blocking.
        let handler: CompletionHandler = {
            let ledger = ledger.clone();
            let queue = queue.clone();
            let wake = wake.clone();
            Arc::new(move |done: CompletedRequest| {
                let id = done.request.id;
                let to = match done.status {
                    CompletionStatus::Success => RequestState::Completed,
                    CompletionStatus::Cancelled => RequestState::Cancelled,
                };
                let _ = ledger.transition(id, RequestState::Submitted, to);
                let _ = queue.push_done(done);
                wake.notify();
            })
        };
        device.set_completion_handler(handler);

        let primary = layouts[0].clone();
        let primed = (|| -> Result<(), StartError> {
            for slot in 0..slot_count {
                let id = RequestId(slot);
                let ticket = pools[0].acquire().ok_or_else(|| {
                    StartError::Device(DeviceError::Driver(
                        "primary pool under-provisioned".into(),
                    ))
                })?;
                ledger.transition(id, RequestState::Idle, RequestState::Filled)?;
                ledger.transition(id, RequestState::Filled, RequestState::Submitted)?;
                device.submit(DriverRequest {
                    id,
                    buffers: smallvec![(primary.stream, ticket)],
                })?;
            }
            Ok(())
        })();

        if let Err(err) = primed {
            warn!(error = %err, "start failed while priming requests, rolling back");
            device.cancel_all();
            drain_in_flight(&queue, &ledger, &mut pools, &wake, tunables.drain_timeout());
            for pool in pools.drain(..) {
                pool.teardown();
            }
            device.release();
            return Err(err);
        }
        drop(device);

        self.running.store(true, Ordering::Release);
        self.dispatcher.reset();
        self.capture_raw.store(false, Ordering::Release);

        let raw_stream = report
            .layout_for_role(StreamRole::Raw)
            .map(|layout| layout.stream);
        let frame_pool = FramePool::with_limits(
            slot_count,
            primary.frame_len(),
            slot_count + tunables.pool_spare,
        );
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let ctx = WorkerCtx {
            device: self.device.clone(),
            queue,
            ledger,
            pools,
            layouts,
            primary_stream: primary.stream,
            raw_stream,
            frame_pool,
            sink: self.sink.clone(),
            raw_sink: self.raw_sink.clone(),
            dispatcher: self.dispatcher.clone(),
            stats: self.stats.clone(),
            capture_raw: self.capture_raw.clone(),
            running: self.running.clone(),
            wake: wake.clone(),
            drain_timeout: tunables.drain_timeout(),
            last_timestamp: 0,
            next_sequence: None,
        };
        let worker = thread::spawn(move || ctx.run(stop_rx));
        self.runtime = Some(Runtime {
            stop_tx,
            wake,
            worker,
        });
        info!(
            device = %self.descriptor.id,
            slots = slot_count,
            "capture session started"
        );
        Ok(())
    }

    /// Stop the consumer loop and return every buffer to the driver-free
    /// state. Safe to call at any time, including twice or after a failed
    /// start; a no-op when nothing is running.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        debug!(device = %self.descriptor.id, "stopping capture session");
        self.dispatcher.halt();
        let _ = runtime.stop_tx.send(());
        runtime.wake.notify();
        let _ = runtime.worker.join();
        info!(
            device = %self.descriptor.id,
            frames = self.stats.frames(),
            "capture session stopped"
        );
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        // Best-effort shutdown when the caller forgot to stop.
        if self.runtime.is_some() {
            self.stop();
        }
    }
}

struct WorkerCtx {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    queue: Arc<CompletionQueue<CompletedRequest>>,
    ledger: Arc<RequestLedger>,
    pools: Vec<BufferPool>,
    layouts: Vec<StreamLayout>,
    primary_stream: StreamId,
    raw_stream: Option<StreamId>,
    frame_pool: FramePool,
    sink: Arc<dyn FrameSink>,
    raw_sink: Option<Arc<dyn RawSink>>,
    dispatcher: Arc<FilterDispatcher>,
    stats: SessionStats,
    capture_raw: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    wake: Arc<Wakeup>,
    drain_timeout: Duration,
    last_timestamp: u64,
    next_sequence: Option<u64>,
}

impl WorkerCtx {
    fn run(mut self, stop_rx: mpsc::Receiver<()>) {
        'outer: loop {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            self.wake.wait(IDLE_WAIT);
            loop {
                match self.queue.pop_done() {
                    RecvOutcome::Data(done) => {
                        if !self.handle_completion(done) {
                            warn!("device failed, shutting down capture loop");
                            break 'outer;
                        }
                    }
                    RecvOutcome::Empty | RecvOutcome::Closed => break,
                }
            }
        }
        self.shutdown();
    }

    fn handle_completion(&mut self, done: CompletedRequest) -> bool {
        match done.status {
            CompletionStatus::Cancelled => {
                let id = done.request.id;
                self.release_buffers(done.request.buffers);
                let _ = self
                    .ledger
                    .transition(id, RequestState::Cancelled, RequestState::Idle);
                true
            }
            CompletionStatus::Success => self.deliver(done),
        }
    }

    fn deliver(&mut self, done: CompletedRequest) -> bool {
        let id = done.request.id;
        let sequence = done.sequence;
        let timestamp = done.timestamp;

        // Instantaneous rate from driver timestamps. Zero until two frames
        // have been seen, and zero again if the clock did not advance.
        let fps = if self.last_timestamp != 0 && timestamp > self.last_timestamp {
            1e9 / (timestamp - self.last_timestamp) as f64
        } else {
            0.0
        };
        self.last_timestamp = timestamp;
        let sequence_gap = match self.next_sequence {
            Some(expected) => sequence.saturating_sub(expected),
            None => 0,
        };
        self.next_sequence = Some(sequence + 1);
        if sequence_gap > 0 {
            self.stats.record_sequence_gap(sequence_gap);
            debug!(sequence, gap = sequence_gap, "driver skipped frames");
        }

        // Copy planes out of the hardware buffers while the driver still
        // owns nothing of this request but the tickets.
        let mut primary_frame: Option<Frame> = None;
        let mut raw_frame: Option<Frame> = None;
        for (stream, ticket) in &done.request.buffers {
            let Some(pool_idx) = self.pools.iter().position(|p| p.stream() == *stream) else {
                warn!(%stream, "completion for unknown stream");
                continue;
            };
            if let Some(layout) = self.layouts.iter().find(|l| l.stream == *stream) {
                let used: &[usize] = if *stream == self.primary_stream {
                    &done.bytes_used
                } else {
                    &[]
                };
                let frame = copy_frame(
                    &self.frame_pool,
                    self.pools[pool_idx].mapping(ticket),
                    layout,
                    used,
                    timestamp,
                    sequence,
                );
                if *stream == self.primary_stream {
                    primary_frame = Some(frame);
                } else {
                    raw_frame = Some(frame);
                }
            }
        }
        let _ = self
            .ledger
            .transition(id, RequestState::Completed, RequestState::Delivered);

        // The copied-out request parks on the free lane for the duration of
        // presentation; its tickets go back to the driver only afterwards.
        // One request at a time and the lane holds queue_depth, so the push
        // cannot fail while the loop is running.
        let parked = self.queue.push_free(done);
        debug_assert_eq!(parked, SendOutcome::Ok);

        if let (Some(frame), Some(raw_sink)) = (raw_frame, self.raw_sink.as_ref()) {
            info!(sequence, "raw capture delivered");
            raw_sink.present_raw(&frame);
        }

        if let Some(frame) = primary_frame {
            let delivered = DeliveredFrame {
                frame,
                sequence,
                sequence_gap,
                fps,
            };
            self.sink.present(&delivered);
            self.stats.record_frame(fps);
            if self.dispatcher.offer(delivered.frame) == DispatchOutcome::Busy {
                debug!(sequence, "frame skipped analysis");
            }
        }

        while let RecvOutcome::Data(freed) = self.queue.pop_free() {
            let id = freed.request.id;
            self.release_buffers(freed.request.buffers);
            let _ = self
                .ledger
                .transition(id, RequestState::Delivered, RequestState::Idle);
            if !self.requeue(id) {
                return false;
            }
        }
        true
    }

    /// Refill a slot and hand it back to the driver. Returns false only on a
    /// device failure that should end the loop.
    fn requeue(&mut self, id: RequestId) -> bool {
        let Some(ticket) = self.pools[0].acquire() else {
            self.stats.record_skipped_cycle();
            warn!(%id, "no free buffer, slot left idle this cycle");
            return true;
        };
        if self
            .ledger
            .transition(id, RequestState::Idle, RequestState::Filled)
            .is_err()
        {
            self.pools[0].release(ticket);
            return true;
        }
        let mut buffers: SmallVec<[(StreamId, BufferTicket); 2]> =
            smallvec![(self.primary_stream, ticket)];
        if self.capture_raw.load(Ordering::Acquire)
            && let Some(raw_stream) = self.raw_stream
            && let Some(raw_idx) = self.pools.iter().position(|p| p.stream() == raw_stream)
        {
            if let Some(raw_ticket) = self.pools[raw_idx].acquire() {
                buffers.push((raw_stream, raw_ticket));
                self.capture_raw.store(false, Ordering::Release);
                debug!(%id, "raw buffer attached for one-shot capture");
            } else {
                // Stay armed; the raw buffer from the previous capture has
                // not come back yet.
                warn!("raw pool exhausted, capture stays armed");
            }
        }
        if self
            .ledger
            .transition(id, RequestState::Filled, RequestState::Submitted)
            .is_err()
        {
            self.release_buffers(buffers);
            return true;
        }
        match self.device.lock().submit(DriverRequest { id, buffers }) {
            Ok(()) => true,
            Err(err) => {
                warn!(code = err.code(), error = %err, "requeue failed");
                // The driver consumed the request without completing it;
                // settle the slot so drain accounting does not wait on it.
                let _ = self
                    .ledger
                    .transition(id, RequestState::Submitted, RequestState::Cancelled);
                let _ = self
                    .ledger
                    .transition(id, RequestState::Cancelled, RequestState::Idle);
                false
            }
        }
    }

    fn release_buffers(&mut self, buffers: SmallVec<[(StreamId, BufferTicket); 2]>) {
        for (stream, ticket) in buffers {
            if let Some(idx) = self.pools.iter().position(|p| p.stream() == stream) {
                self.pools[idx].release(ticket);
            }
        }
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.device.lock().cancel_all();
        drain_in_flight(
            &self.queue,
            &self.ledger,
            &mut self.pools,
            &self.wake,
            self.drain_timeout,
        );
        self.queue.close();
        for pool in &self.pools {
            if pool.free_count() != pool.capacity() {
                warn!(
                    stream = %pool.stream(),
                    free = pool.free_count(),
                    capacity = pool.capacity(),
                    "buffers missing at teardown"
                );
            }
        }
        for pool in self.pools.drain(..) {
            pool.teardown();
        }
        self.device.lock().release();
        debug!("consumer loop exited");
    }
}

/// Pull completions until no request is in flight (or the timeout passes),
/// recycling every buffer without delivering anything.
fn drain_in_flight(
    queue: &CompletionQueue<CompletedRequest>,
    ledger: &RequestLedger,
    pools: &mut [BufferPool],
    wake: &Wakeup,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        while let RecvOutcome::Data(done) = queue.pop_done() {
            let id = done.request.id;
            for (stream, ticket) in done.request.buffers {
                if let Some(idx) = pools.iter().position(|p| p.stream() == stream) {
                    pools[idx].release(ticket);
                }
            }
            match done.status {
                CompletionStatus::Success => {
                    let _ = ledger.transition(id, RequestState::Completed, RequestState::Delivered);
                    let _ = ledger.transition(id, RequestState::Delivered, RequestState::Idle);
                }
                CompletionStatus::Cancelled => {
                    let _ = ledger.transition(id, RequestState::Cancelled, RequestState::Idle);
                }
            }
        }
        if ledger.in_flight() == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                in_flight = ledger.in_flight(),
                "driver kept buffers past drain timeout"
            );
            return;
        }
        wake.wait(IDLE_WAIT);
    }
}

fn copy_frame(
    frame_pool: &FramePool,
    mapping: &Arc<dyn BufferMapping>,
    layout: &StreamLayout,
    bytes_used: &[usize],
    timestamp: u64,
    sequence: u64,
) -> Frame {
    let mut buffers: SmallVec<[PoolLease; 3]> = SmallVec::new();
    let mut layouts: SmallVec<[PlaneLayout; 3]> = SmallVec::new();
    for index in 0..mapping.plane_count() {
        let src = mapping.plane(index).unwrap_or(&[]);
        let used = bytes_used
            .get(index)
            .copied()
            .filter(|&used| used > 0)
            .unwrap_or(src.len());
        let len = used.min(src.len());
        let mut lease = frame_pool.lease();
        lease.resize(len);
        lease.as_mut_slice().copy_from_slice(&src[..len]);
        buffers.push(lease);
        layouts.push(PlaneLayout {
            offset: 0,
            len,
            stride: layout.stride,
        });
    }
    Frame::multi_plane(
        FrameMeta::new(layout.format, timestamp, sequence),
        buffers,
        layouts,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MeanLevelFilter;
    use crate::sink::{CollectRawSink, CollectSink};
    use aperture_core::prelude::Resolution;
    use aperture_device::virtual_device::{VirtualDevice, VirtualHandle};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn viewfinder_session() -> (CaptureSession, VirtualHandle, Arc<CollectSink>) {
        let (device, handle) = VirtualDevice::with_defaults();
        let sink = Arc::new(CollectSink::default());
        let mut session = CaptureSession::new(Box::new(device), sink.clone());
        let status = session
            .configure(&[StreamSpec::viewfinder()
                .with_format(*b"RG24")
                .with_resolution(Resolution::new(640, 480).unwrap())])
            .unwrap();
        assert_eq!(status, ConfigStatus::Exact);
        (session, handle, sink)
    }

    #[test]
    fn delivers_and_recycles_across_many_completions() {
        let (mut session, handle, sink) = viewfinder_session();
        session.start().unwrap();
        assert!(session.is_running());
        assert_eq!(handle.pending(), 4);

        for i in 0..10u64 {
            assert!(wait_until(Duration::from_secs(5), || handle.pending() == 4));
            assert!(handle.complete_next((i + 1) * 33_000_000));
        }
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 10));
        // Every slot requeued: with 4 buffers, 10 completions only work if
        // each delivery recycled its buffer.
        assert!(wait_until(Duration::from_secs(5), || handle.pending() == 4));
        assert_eq!(session.stats().frames(), 10);
        assert_eq!(session.stats().skipped_cycles(), 0);

        let records = sink.records();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<u64>>());
        assert!(records.iter().all(|r| r.sequence_gap == 0));

        session.stop();
        assert!(!session.is_running());
        assert_eq!(handle.pending(), 0);
    }

    /// Records how many requests the driver still holds at the moment each
    /// frame is presented.
    struct PendingSnapshotSink {
        handle: VirtualHandle,
        seen: parking_lot::Mutex<Vec<usize>>,
    }

    impl FrameSink for PendingSnapshotSink {
        fn present(&self, _frame: &DeliveredFrame) {
            self.seen.lock().push(self.handle.pending());
        }
    }

    #[test]
    fn buffers_return_to_the_driver_only_after_presentation() {
        let (device, handle) = VirtualDevice::with_defaults();
        let sink = Arc::new(PendingSnapshotSink {
            handle: handle.clone(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let mut session = CaptureSession::new(Box::new(device), sink.clone());
        session
            .configure(&[StreamSpec::viewfinder()
                .with_format(*b"RG24")
                .with_resolution(Resolution::new(640, 480).unwrap())])
            .unwrap();
        session.start().unwrap();
        assert_eq!(handle.pending(), 4);

        handle.complete_next(1_000_000);
        assert!(wait_until(Duration::from_secs(5), || handle.pending() == 4));

        // The completed slot must still be out of the driver's hands while
        // the sink runs, and back in them once delivery has finished.
        assert_eq!(sink.seen.lock().as_slice(), &[3]);
        session.stop();
    }

    #[test]
    fn first_frame_fps_is_zero_then_positive() {
        let (mut session, handle, sink) = viewfinder_session();
        session.start().unwrap();
        handle.complete_next(1_000_000);
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 1));
        handle.complete_next(34_000_000);
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 2));
        session.stop();

        let records = sink.records();
        assert_eq!(records[0].fps, 0.0);
        let expected = 1e9 / 33_000_000.0;
        assert!((records[1].fps - expected).abs() < 0.1);
        assert!((session.stats().last_fps() - expected).abs() < 0.1);
    }

    #[test]
    fn start_requires_configure_and_rejects_double_start() {
        let (device, _handle) = VirtualDevice::with_defaults();
        let mut session = CaptureSession::new(Box::new(device), Arc::new(CollectSink::default()));
        assert!(matches!(session.start(), Err(StartError::NotConfigured)));

        session.configure(&[StreamSpec::viewfinder()]).unwrap();
        session.start().unwrap();
        assert!(matches!(session.start(), Err(StartError::AlreadyRunning)));
        assert!(matches!(
            session.configure(&[StreamSpec::viewfinder()]),
            Err(ConfigError::SessionRunning)
        ));
        session.stop();
    }

    #[test]
    fn stop_is_idempotent_and_session_restartable() {
        let (mut session, handle, sink) = viewfinder_session();
        session.stop();
        session.start().unwrap();
        session.stop();
        session.stop();
        assert_eq!(handle.pending(), 0);

        session.start().unwrap();
        handle.complete_next(1_000_000);
        assert!(wait_until(Duration::from_secs(5), || !sink.is_empty()));
        session.stop();
    }

    #[test]
    fn failed_allocation_rolls_back_device() {
        let (device, handle) = VirtualDevice::with_defaults();
        let mut session = CaptureSession::new(Box::new(device), Arc::new(CollectSink::default()));
        session.configure(&[StreamSpec::viewfinder()]).unwrap();

        handle.inject_allocation_failure(true);
        assert!(matches!(session.start(), Err(StartError::Allocation(_))));
        assert!(!session.is_running());

        // The device was released on rollback, so acquire works again.
        handle.inject_allocation_failure(false);
        session.start().unwrap();
        session.stop();
    }

    #[test]
    fn device_failure_during_requeue_stops_the_loop() {
        let (mut session, handle, sink) = viewfinder_session();
        session.start().unwrap();
        handle.complete_next(1_000_000);
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 1));

        handle.inject_submit_failure(true);
        handle.complete_next(2_000_000);
        assert!(wait_until(Duration::from_secs(5), || !session.is_running()));
        handle.inject_submit_failure(false);
        session.stop();
    }

    #[test]
    fn armed_raw_capture_fires_once() {
        let (device, handle) = VirtualDevice::with_defaults();
        let raw_sink = Arc::new(CollectRawSink::default());
        let mut session = CaptureSession::new(Box::new(device), Arc::new(CollectSink::default()));
        session.set_raw_sink(raw_sink.clone());
        session
            .configure(&[StreamSpec::viewfinder(), StreamSpec::raw()])
            .unwrap();

        assert!(!session.arm_raw_capture());
        session.start().unwrap();
        assert!(session.arm_raw_capture());

        // The armed raw buffer rides on the first requeued request, which sits
        // behind the other primed slots; the fifth completion delivers it.
        for i in 0..5u64 {
            assert!(wait_until(Duration::from_secs(5), || handle.pending() == 4));
            handle.complete_next((i + 1) * 1_000_000);
        }
        assert!(wait_until(Duration::from_secs(5), || raw_sink.count() == 1));
        // One-shot: later frames carry no raw buffer.
        for i in 5..9u64 {
            assert!(wait_until(Duration::from_secs(5), || handle.pending() == 4));
            handle.complete_next((i + 1) * 1_000_000);
        }
        assert!(wait_until(Duration::from_secs(1), || {
            raw_sink.count() == 1
        }));
        session.stop();
        assert_eq!(raw_sink.count(), 1);
        assert!(raw_sink.last_len() > 0);
    }

    #[test]
    fn filters_receive_frames_from_the_loop() {
        let (mut session, handle, sink) = viewfinder_session();
        session.filters().add(Arc::new(MeanLevelFilter::new()));
        let reports = session.filter_reports();
        session.start().unwrap();

        handle.complete_next(1_000_000);
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 1));
        assert!(wait_until(Duration::from_secs(5), || {
            matches!(reports.recv(), RecvOutcome::Data(report) if !report.sets.is_empty())
        }));
        session.stop();
    }
}
