use ze_bench::driver::{Driver, KernelArg};
use ze_bench::kernels::COPY_KERNEL;
use ze_bench::peak::{ALL_TESTS, GLOBAL_BW};
use ze_bench::peer::PeerParams;
use ze_bench::sim::SimConfig;
use ze_bench::workgroups::solve;
use ze_bench::{
    Error, KernelLibrary, PeakBenchmark, PeerBenchmark, PeerMetric, PeerTransfer, Session,
    SimDriver, TimingEngine, TimingMode,
};

fn create_test_session(devices: usize, launch_ticks: Vec<u64>) -> Session<SimDriver> {
    let mut config = SimConfig::new(devices);
    config.capability.compute_units = 2;
    config.capability.max_group_size_x = 128;
    config.launch_ticks = launch_ticks;
    Session::open(SimDriver::new(config), &KernelLibrary::builtin()).unwrap()
}

fn small_params(iterations: u32) -> PeerParams {
    PeerParams {
        elements: 256,
        warmup_iterations: 1,
        iterations,
    }
}

#[test]
fn test_integration_full_peer_suite() {
    let mut session = create_test_session(2, vec![100]);
    let mut out = Vec::new();
    {
        let mut peer = PeerBenchmark::new(&mut session)
            .with_bandwidth_params(small_params(2))
            .with_latency_params(small_params(3));
        for (bidirectional, transfer) in [
            (false, PeerTransfer::Write),
            (false, PeerTransfer::Read),
            (true, PeerTransfer::None),
        ] {
            let bw = peer.bandwidth(bidirectional, transfer, &mut out).unwrap();
            let lat = peer.latency(bidirectional, transfer, &mut out).unwrap();
            assert_eq!(bw.len(), 4);
            assert_eq!(lat.len(), 4);
            assert!(bw.iter().all(|m| m.metric == PeerMetric::Bandwidth));
            assert!(lat.iter().all(|m| m.value >= 0.0));
        }
    }

    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.lines().count(), 24);
    assert!(text.contains(" Device(1)<-Device(0): "));
    assert!(text.contains(" Device(0)<->Device(1):  GBPS "));

    let driver = session.close().unwrap();
    assert_eq!(driver.live_buffers(), 0);
    assert_eq!(driver.live_kernels(), 0);
    assert_eq!(driver.live_lists(), 0);
    // One buffer per device per run.
    assert_eq!(driver.stats().allocations, 12);
    assert_eq!(driver.stats().frees, 12);
}

#[test]
fn test_integration_copy_moves_data_between_devices() {
    let mut session = create_test_session(2, vec![1]);
    let (driver, contexts) = session.split();
    let ctx = &contexts[0];

    let src = driver.allocate(0, 64).unwrap();
    let dst = driver.allocate(1, 64).unwrap();
    let payload: Vec<u8> = (0..64).collect();
    driver.write_buffer(src, 0, &payload).unwrap();

    let kernel = driver.create_kernel(ctx.module, COPY_KERNEL).unwrap();
    let size = driver.suggest_group_size(kernel, [8, 1, 1]).unwrap();
    assert_eq!(size, [8, 1, 1]);
    driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(dst)).unwrap();
    driver.set_kernel_argument(kernel, 1, KernelArg::Buffer(src)).unwrap();

    let (plan, _) = solve(8, &ctx.capability);
    let engine = TimingEngine::new(0, 1).unwrap();
    engine
        .run_kernel(driver, ctx, kernel, &plan, TimingMode::Bandwidth, true)
        .unwrap();
    let mut landed = vec![0u8; 64];
    driver.read_buffer(dst, 0, &mut landed).unwrap();
    assert_eq!(landed, payload);

    driver.destroy_kernel(kernel).unwrap();
    driver.free(src).unwrap();
    driver.free(dst).unwrap();
}

#[test]
fn test_integration_all_peak_tests() {
    let mut session = create_test_session(1, vec![500]);
    let engine = TimingEngine::new(1, 2).unwrap();
    let mut out = Vec::new();
    let mut peak = PeakBenchmark::new(&mut session, 0, engine).with_event_timer(true);
    let mut total = 0;
    for test in ALL_TESTS {
        let results = peak.run(test, &mut out).unwrap();
        assert!(!results.is_empty(), "{} produced nothing", test);
        total += results.len();
    }
    // Bandwidth and four compute families at three widths, two transfer
    // directions and two latency modes.
    assert_eq!(total, 3 + 3 * 4 + 2 + 2);

    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches("<<<<<<<<<<<<<<<<<<<<<<<<<<<<").count(), 7);
    assert!(text.contains("Single-precision compute (GFLOPS)"));
    assert!(text.contains("Half-precision compute (GFLOPS)"));
    assert!(text.contains("device_to_host"));

    let driver = session.close().unwrap();
    assert_eq!(driver.live_buffers(), 0);
    assert_eq!(driver.live_events(), 0);
    assert_eq!(driver.live_pools(), 0);
}

#[test]
fn test_integration_event_timed_bandwidth_is_deterministic() {
    let mut session = create_test_session(1, vec![2000]);
    let engine = TimingEngine::new(2, 4).unwrap();
    let mut out = Vec::new();
    let results = PeakBenchmark::new(&mut session, 0, engine)
        .with_event_timer(true)
        .run(GLOBAL_BW, &mut out)
        .unwrap();
    // 256 work items * 16 fetches * 4 bytes * width in 2 µs.
    for (m, width) in results.iter().zip([1.0, 2.0, 4.0]) {
        let items = 2.0 * 128.0 / width;
        let expected = items * 16.0 * width * 4.0 / 2.0 / 1e3;
        assert!((m.value - expected).abs() < 1e-9, "{} {}", m.variant, m.value);
    }
}

#[test]
fn test_integration_driver_failure_is_fatal() {
    let mut session = create_test_session(2, vec![1]);
    let (driver, _) = session.split();
    driver.fail_on("synchronize_queue", ze_bench::ResultCode::DeviceLost);

    let mut out = Vec::new();
    let err = PeerBenchmark::new(&mut session)
        .with_latency_params(small_params(1))
        .latency(false, PeerTransfer::Write, &mut out)
        .unwrap_err();
    assert!(matches!(err, Error::Driver { op: "synchronize_queue", .. }));
    assert!(out.is_empty());
    assert_eq!(session.driver().live_buffers(), 0);
}

#[test]
fn test_integration_measurements_serialize() {
    let mut session = create_test_session(1, vec![1]);
    let mut out = Vec::new();
    let results = PeerBenchmark::new(&mut session)
        .with_latency_params(small_params(1))
        .latency(false, PeerTransfer::Read, &mut out)
        .unwrap();
    let json = serde_json::to_string(&results[0]).unwrap();
    assert!(json.contains("\"transfer\":\"read\""));
    assert!(json.contains("\"metric\":\"latency\""));
}

#[test]
fn test_integration_unsupported_precisions_are_skipped() {
    let mut config = SimConfig::new(1);
    config.capability.compute_units = 2;
    config.capability.max_group_size_x = 128;
    config.capability.fp16 = false;
    config.capability.fp64 = false;
    let mut session = Session::open(SimDriver::new(config), &KernelLibrary::builtin()).unwrap();

    let mut out = Vec::new();
    let mut peak = PeakBenchmark::new(&mut session, 0, TimingEngine::new(0, 1).unwrap());
    let mut reported = 0;
    for test in ALL_TESTS {
        reported += peak.run(test, &mut out).unwrap().len();
    }
    assert_eq!(reported, 3 + 3 + 3 + 2 + 2);

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("half : unsupported (no fp16 support)"));
    assert!(text.contains("double : unsupported (no fp64 support)"));
}
