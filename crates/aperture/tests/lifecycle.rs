//! End-to-end run against the virtual device with a free-running clock.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use aperture::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn clocked_capture_with_filters() {
    init_tracing();
    let registry = DeviceRegistry::default();
    let (device, handle) = VirtualDevice::with_defaults();
    let sink = Arc::new(CollectSink::default());
    let mut session = registry.open(Box::new(device), sink.clone()).unwrap();

    let filter = Arc::new(MeanLevelFilter::new());
    session.filters().add(filter.clone());
    let reports = session.filter_reports();

    let status = session
        .configure(&[StreamSpec::viewfinder().with_resolution("1280x720".parse().unwrap())])
        .unwrap();
    assert_eq!(status, ConfigStatus::Exact);
    session.start().unwrap();

    let clock = handle.spawn_clock(Duration::from_millis(5));
    assert!(wait_until(Duration::from_secs(10), || sink.len() >= 20));
    drop(clock);
    session.stop();
    assert!(!session.is_running());

    let stats = session.stats();
    assert!(stats.frames() >= 20);
    assert!(stats.rolling_fps() > 0.0);
    assert_eq!(stats.filter_panics(), 0);

    // The clock runs faster than analysis in the worst case; every report
    // that did land must carry the mean-level detection.
    let mut saw_report = false;
    while let RecvOutcome::Data(report) = reports.recv() {
        assert!(report.sets.iter().any(|set| set.producer == "mean-level"));
        saw_report = true;
    }
    assert!(saw_report);

    let records = sink.records();
    let mut last = None;
    for record in &records {
        if let Some(prev) = last {
            assert!(record.sequence > prev);
        }
        last = Some(record.sequence);
    }
}

#[test]
fn registry_frees_device_after_session_drop() {
    init_tracing();
    let registry = DeviceRegistry::default();
    let (device, handle) = VirtualDevice::with_defaults();
    let mut session = registry
        .open_with_tunables(
            Box::new(device),
            Arc::new(NullSink),
            SessionTunables {
                buffer_count: 2,
                ..SessionTunables::default()
            },
        )
        .unwrap();
    session.configure(&[StreamSpec::viewfinder()]).unwrap();
    session.start().unwrap();
    assert_eq!(handle.pending(), 2);
    drop(session);

    assert!(registry.active_ids().is_empty());
    assert_eq!(handle.pending(), 0);
}
