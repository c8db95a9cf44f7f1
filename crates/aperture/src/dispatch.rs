use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, warn};

use aperture_core::prelude::{BoundedRx, BoundedTx, Frame, SendOutcome, bounded};

use crate::{
    filter::{DetectionSet, FilterChain, VideoFilter},
    stats::SessionStats,
};

/// What happened to a frame offered for analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A filter run was started for this frame.
    Started,
    /// A previous run is still in flight; the frame skipped analysis.
    Busy,
    /// No filter is attached and enabled.
    Idle,
    /// The dispatcher has been halted by session stop.
    Halted,
}

/// Everything the filter chain produced for one frame.
#[derive(Debug, Clone)]
pub struct FilterReport {
    /// Sequence number of the analyzed frame.
    pub sequence: u64,
    /// One set per filter that ran, in chain order.
    pub sets: Vec<DetectionSet>,
}

/// Hands frames to the filter chain on the rayon pool, one frame at a time.
///
/// The gate is a single compare-exchange: if analysis of the previous frame
/// is still running, `offer` reports `Busy` and the frame moves on without
/// analysis. Capture cadence therefore never waits on a slow filter; slow
/// filters just see fewer frames.
pub struct FilterDispatcher {
    chain: FilterChain,
    busy: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    reports_tx: BoundedTx<FilterReport>,
    reports_rx: BoundedRx<FilterReport>,
    stats: SessionStats,
}

impl FilterDispatcher {
    /// Create a dispatcher delivering reports through a queue of `depth`.
    pub fn new(chain: FilterChain, depth: usize, stats: SessionStats) -> Self {
        let (reports_tx, reports_rx) = bounded(depth.max(1));
        Self {
            chain,
            busy: Arc::new(AtomicBool::new(false)),
            halted: Arc::new(AtomicBool::new(false)),
            reports_tx,
            reports_rx,
            stats,
        }
    }

    /// Receiver for completed filter reports; clones share the queue.
    pub fn reports(&self) -> BoundedRx<FilterReport> {
        self.reports_rx.clone()
    }

    /// Whether a filter run is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.halted.store(false, Ordering::Release);
    }

    /// Stop accepting frames and suppress reports from the run in flight.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    /// Offer a frame for analysis. Never blocks.
    pub fn offer(&self, frame: Frame) -> DispatchOutcome {
        if self.halted.load(Ordering::Acquire) {
            return DispatchOutcome::Halted;
        }
        let filters = self.chain.snapshot();
        if !filters.iter().any(|f| f.is_enabled()) {
            return DispatchOutcome::Idle;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.record_analysis_drop();
            debug!(sequence = frame.meta().sequence, "analysis busy, frame skipped");
            return DispatchOutcome::Busy;
        }
        let busy = self.busy.clone();
        let halted = self.halted.clone();
        let reports_tx = self.reports_tx.clone();
        let stats = self.stats.clone();
        rayon::spawn(move || {
            run_chain(frame, filters, halted, reports_tx, stats);
            busy.store(false, Ordering::Release);
        });
        DispatchOutcome::Started
    }
}

fn run_chain(
    mut frame: Frame,
    filters: Vec<Arc<dyn VideoFilter>>,
    halted: Arc<AtomicBool>,
    reports_tx: BoundedTx<FilterReport>,
    stats: SessionStats,
) {
    let sequence = frame.meta().sequence;
    let mut sets = Vec::with_capacity(filters.len());
    for filter in filters {
        if !filter.is_enabled() {
            continue;
        }
        let producer = filter.name().to_string();
        // A panic in one filter must not take down the chain or the pool
        // worker; the frame stays usable for the filters after it.
        match panic::catch_unwind(AssertUnwindSafe(|| filter.apply(&mut frame))) {
            Ok(detections) => sets.push(DetectionSet {
                producer,
                detections,
            }),
            Err(_) => {
                stats.record_filter_panic();
                warn!(filter = %producer, sequence, "filter panicked, result discarded");
            }
        }
    }
    if !halted.load(Ordering::Acquire)
        && reports_tx.send(FilterReport { sequence, sets }) == SendOutcome::Full
    {
        stats.record_analysis_drop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Detection, Mask, MeanLevelFilter, Rect, Rgba};
    use aperture_core::prelude::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_frame(sequence: u64) -> Frame {
        let pool = FramePool::with_capacity(1, 64);
        let res = Resolution::new(4, 4).unwrap();
        let fmt = MediaFormat::new(FourCc::new(*b"GREY"), res, ColorSpace::Unknown);
        let mut frame =
            Frame::single_plane(FrameMeta::new(fmt, 0, sequence), pool.lease(), 16, 4);
        frame.planes_mut()[0].data().fill(100);
        frame
    }

    fn recv_report(rx: &BoundedRx<FilterReport>, timeout: Duration) -> Option<FilterReport> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match rx.recv() {
                RecvOutcome::Data(report) => return Some(report),
                RecvOutcome::Closed => return None,
                RecvOutcome::Empty => {
                    if std::time::Instant::now() > deadline {
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }

    /// Blocks inside `apply` until told to finish.
    struct GatedFilter {
        release: parking_lot::Mutex<mpsc::Receiver<()>>,
        started: mpsc::Sender<()>,
    }

    impl VideoFilter for GatedFilter {
        fn name(&self) -> &str {
            "gated"
        }

        fn apply(&self, _frame: &mut Frame) -> Vec<Detection> {
            let _ = self.started.send(());
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
            Vec::new()
        }
    }

    /// Stands in for a segmentation backend: fixed box, color and mask.
    struct BoxFilter;

    impl VideoFilter for BoxFilter {
        fn name(&self) -> &str {
            "boxes"
        }

        fn apply(&self, _frame: &mut Frame) -> Vec<Detection> {
            vec![Detection {
                label: "box".into(),
                confidence: 0.9,
                region: Rect {
                    x: 1,
                    y: 1,
                    width: 2,
                    height: 2,
                },
                color: Rgba::opaque(255, 0, 0),
                mask: Mask::new(2, 2, vec![255; 4]),
            }]
        }
    }

    struct PanicFilter;

    impl VideoFilter for PanicFilter {
        fn name(&self) -> &str {
            "panics"
        }

        fn apply(&self, _frame: &mut Frame) -> Vec<Detection> {
            panic!("intentional test panic");
        }
    }

    #[test]
    fn no_filters_means_idle() {
        let dispatcher =
            FilterDispatcher::new(FilterChain::default(), 4, SessionStats::default());
        assert_eq!(dispatcher.offer(test_frame(0)), DispatchOutcome::Idle);
    }

    #[test]
    fn busy_gate_drops_second_frame() {
        let chain = FilterChain::default();
        let (release_tx, release_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();
        chain.add(Arc::new(GatedFilter {
            release: parking_lot::Mutex::new(release_rx),
            started: started_tx,
        }));
        let stats = SessionStats::default();
        let dispatcher = FilterDispatcher::new(chain, 4, stats.clone());
        let reports = dispatcher.reports();

        assert_eq!(dispatcher.offer(test_frame(1)), DispatchOutcome::Started);
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("filter started");
        assert_eq!(dispatcher.offer(test_frame(2)), DispatchOutcome::Busy);
        assert_eq!(stats.analysis_drops(), 1);

        release_tx.send(()).unwrap();
        let report = recv_report(&reports, Duration::from_secs(5)).expect("report");
        assert_eq!(report.sequence, 1);
        assert!(recv_report(&reports, Duration::from_millis(100)).is_none());
    }

    #[test]
    fn report_carries_detections() {
        let chain = FilterChain::default();
        chain.add(Arc::new(MeanLevelFilter::new()));
        let dispatcher = FilterDispatcher::new(chain, 4, SessionStats::default());
        let reports = dispatcher.reports();
        assert_eq!(dispatcher.offer(test_frame(3)), DispatchOutcome::Started);
        let report = recv_report(&reports, Duration::from_secs(5)).expect("report");
        assert_eq!(report.sets.len(), 1);
        assert_eq!(report.sets[0].producer, "mean-level");
        assert_eq!(report.sets[0].detections.len(), 1);
    }

    #[test]
    fn report_preserves_color_and_mask() {
        let chain = FilterChain::default();
        chain.add(Arc::new(BoxFilter));
        let dispatcher = FilterDispatcher::new(chain, 4, SessionStats::default());
        let reports = dispatcher.reports();
        assert_eq!(dispatcher.offer(test_frame(8)), DispatchOutcome::Started);
        let report = recv_report(&reports, Duration::from_secs(5)).expect("report");
        let detection = &report.sets[0].detections[0];
        assert_eq!(detection.color, Rgba::opaque(255, 0, 0));
        let mask = detection.mask.as_ref().expect("mask");
        assert_eq!((mask.width(), mask.height()), (2, 2));
        assert!(mask.data().iter().all(|&b| b == 255));
    }

    #[test]
    fn halt_while_a_run_is_in_flight_suppresses_its_report() {
        let chain = FilterChain::default();
        let (release_tx, release_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();
        chain.add(Arc::new(GatedFilter {
            release: parking_lot::Mutex::new(release_rx),
            started: started_tx,
        }));
        let dispatcher = FilterDispatcher::new(chain, 4, SessionStats::default());
        let reports = dispatcher.reports();

        assert_eq!(dispatcher.offer(test_frame(9)), DispatchOutcome::Started);
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("filter started");
        dispatcher.halt();
        release_tx.send(()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dispatcher.is_busy() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!dispatcher.is_busy());
        assert!(recv_report(&reports, Duration::from_millis(100)).is_none());
    }

    #[test]
    fn panicking_filter_does_not_starve_the_chain() {
        let chain = FilterChain::default();
        chain.add(Arc::new(PanicFilter));
        chain.add(Arc::new(MeanLevelFilter::new()));
        let stats = SessionStats::default();
        let dispatcher = FilterDispatcher::new(chain, 4, stats.clone());
        let reports = dispatcher.reports();

        assert_eq!(dispatcher.offer(test_frame(4)), DispatchOutcome::Started);
        let report = recv_report(&reports, Duration::from_secs(5)).expect("report");
        assert_eq!(report.sets.len(), 1);
        assert_eq!(report.sets[0].producer, "mean-level");
        assert_eq!(stats.filter_panics(), 1);

        // The gate must have been released despite the panic.
        assert_eq!(dispatcher.offer(test_frame(5)), DispatchOutcome::Started);
        assert!(recv_report(&reports, Duration::from_secs(5)).is_some());
    }

    #[test]
    fn halted_dispatcher_refuses_frames() {
        let chain = FilterChain::default();
        chain.add(Arc::new(MeanLevelFilter::new()));
        let dispatcher = FilterDispatcher::new(chain, 4, SessionStats::default());
        dispatcher.halt();
        assert_eq!(dispatcher.offer(test_frame(6)), DispatchOutcome::Halted);
        dispatcher.reset();
        assert_eq!(dispatcher.offer(test_frame(7)), DispatchOutcome::Started);
    }
}
