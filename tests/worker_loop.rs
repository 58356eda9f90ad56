//! Integration tests for the worker loop against the in-memory
//! [`MockBackend`]: ownership discipline, counter conservation, and the
//! bounded stop latency the cooperative-cancellation model promises.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ito_reflector::backend::mock::MockBackend;
use ito_reflector::config::{Config, ReflectionMode, SignatureFilter};
use ito_reflector::stats::{AggregateStats, WorkerStats};
use ito_reflector::worker;

const LOCAL_MAC: [u8; 6] = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];

fn test_config() -> Config {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut cfg = Config::new("mock0", LOCAL_MAC);
    cfg.worker_count = 1;
    cfg.cpu_pin = vec![None];
    cfg.batch_size = 8;
    cfg.mode = ReflectionMode::MacIpPorts;
    cfg.sig_filter = SignatureFilter::All;
    cfg
}

fn valid_probeot_frame() -> Vec<u8> {
    let hex = "00 01 55 17 1e 1b  00 c0 17 54 05 98  08 00 \
        45 00 00 27 00 00 40 00 40 11 00 00 c0 a8 00 0a c0 a8 00 01 \
        0f 02 0f 03 00 13 00 00 \
        09 10 ea 1d 00 \
        50 52 4f 42 45 4f 54 \
        00 00 00 00";
    hex.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).unwrap())
        .collect()
}

/// Runs the worker loop to completion in the current thread: sets the
/// stop flag before spawning so `run` executes exactly one burst (the
/// mandatory final drain) and returns, without needing a second OS thread.
fn run_one_pass(cfg: Config, backend: MockBackend) -> (ito_reflector::backend::mock::MockObserver, Arc<WorkerStats>) {
    let observer = backend.observer();
    let stats = Arc::new(WorkerStats::default());
    let stop_flag: worker::StopFlag = Arc::new(AtomicBool::new(true));
    worker::run(0, Arc::new(cfg), Box::new(backend), Arc::clone(&stats), stop_flag);
    (observer, stats)
}

#[test]
fn accepted_packet_is_reflected_and_sent() {
    let cfg = test_config();
    let mut backend = MockBackend::new(128, 4);
    let frame = valid_probeot_frame();
    backend.push_rx(0, &frame, None);

    let (observer, stats) = run_one_pass(cfg, backend);

    assert_eq!(observer.tx_count(), 1);
    assert_eq!(observer.sent_ids(), vec![0]);
    assert!(observer.released_ids().is_empty());

    let sent = &observer.tx_frames()[0];
    assert_eq!(&sent[0..6], &[0x00, 0xc0, 0x17, 0x54, 0x05, 0x98]);
    assert_eq!(&sent[6..12], &LOCAL_MAC);

    let snap = stats.snapshot();
    assert_eq!(snap.packets_received, 1);
    assert_eq!(snap.packets_reflected, 1);
    assert_eq!(snap.err_counters.err_too_short, 0);
}

#[test]
fn rejected_packet_is_released_not_sent() {
    let cfg = test_config();
    let mut backend = MockBackend::new(128, 4);
    let mut frame = valid_probeot_frame();
    frame[0..6].copy_from_slice(&[0xff; 6]); // wrong destination MAC
    backend.push_rx(0, &frame, None);

    let (observer, stats) = run_one_pass(cfg, backend);

    assert_eq!(observer.tx_count(), 0);
    assert!(observer.sent_ids().is_empty());
    assert_eq!(observer.released_ids(), vec![0]);

    let snap = stats.snapshot();
    assert_eq!(snap.packets_received, 1);
    assert_eq!(snap.packets_reflected, 0);
    assert_eq!(snap.err_counters.err_invalid_mac, 1);
}

#[test]
fn every_descriptor_is_consumed_exactly_once_per_burst() {
    let cfg = test_config();
    let mut backend = MockBackend::new(128, 4);
    let accept = valid_probeot_frame();
    let mut reject = accept.clone();
    reject[0..6].copy_from_slice(&[0xff; 6]);
    backend.push_rx(0, &accept, None);
    backend.push_rx(1, &reject, None);

    let (observer, stats) = run_one_pass(cfg, backend);

    let mut consumed: Vec<u64> = observer
        .sent_ids()
        .into_iter()
        .chain(observer.released_ids())
        .collect();
    consumed.sort_unstable();
    assert_eq!(consumed, vec![0, 1]);

    let snap = stats.snapshot();
    assert!(snap.packets_received >= snap.packets_reflected + snap.err_counters.err_too_short
        + snap.err_counters.err_invalid_mac
        + snap.err_counters.err_invalid_ethertype
        + snap.err_counters.err_invalid_protocol
        + snap.err_counters.err_invalid_signature);
}

#[test]
fn tx_ring_full_is_counted_and_descriptor_released() {
    let cfg = test_config();
    let mut backend = MockBackend::new(128, 4);
    backend.send_capacity = Some(0); // simulate a full ring
    backend.push_rx(0, &valid_probeot_frame(), None);

    let (observer, stats) = run_one_pass(cfg, backend);

    assert_eq!(observer.tx_count(), 0);
    assert_eq!(observer.released_ids(), vec![0]);
    assert_eq!(stats.snapshot().err_counters.err_tx_failed, 1);
}

#[test]
fn latency_is_aggregated_through_get_stats() {
    let mut cfg = test_config();
    cfg.measure_latency = true;
    let mut backend = MockBackend::new(128, 4);
    // A receive timestamp of 1ns since the clock's epoch is always in the
    // past relative to `now_since_epoch_ns()`, giving a deterministic
    // nonzero one-way latency sample without needing a real sleep.
    backend.push_rx(0, &valid_probeot_frame(), Some(1));

    let (_, stats) = run_one_pass(cfg, backend);

    let snap = stats.snapshot();
    assert_eq!(snap.latency.count, 1);
    assert!(snap.latency.min_ns > 0, "min_ns should not be clamped to 0");
    assert!(snap.latency.max_ns > 0);
    assert!(snap.latency.average_ns() > 0);

    // The same regression through the cross-worker aggregation path
    // `ReflectorCtx::get_stats` uses.
    let agg = AggregateStats::collect(std::iter::once(stats.as_ref()));
    assert!(agg.latency_average_ns() > 0, "get_stats should not report a zero average latency");
}

#[test]
fn stop_latency_is_bounded() {
    let cfg = test_config();
    let backend = MockBackend::new(128, 4);
    let stats = Arc::new(WorkerStats::default());
    let stop_flag: worker::StopFlag = Arc::new(AtomicBool::new(false));

    let cfg = Arc::new(cfg);
    let thread_cfg = Arc::clone(&cfg);
    let thread_stats = Arc::clone(&stats);
    let thread_stop = Arc::clone(&stop_flag);
    let handle = std::thread::spawn(move || {
        worker::run(0, thread_cfg, Box::new(backend), thread_stats, thread_stop);
    });

    std::thread::sleep(Duration::from_millis(20));
    let bound = Duration::from_millis(2 * cfg.poll_timeout_ms.max(1));

    let start = Instant::now();
    stop_flag.store(true, Ordering::Release);
    handle.join().expect("worker thread panicked");
    assert!(
        start.elapsed() < bound,
        "worker took {:?} to stop, expected under {:?}",
        start.elapsed(),
        bound
    );
}
