//! Peer-to-peer copy bandwidth and latency across a device group.
//!
//! Every ordered pair of devices is measured, including a device with itself.
//! Source device `i` runs the copy kernel on its own queue; the buffers of
//! both devices are bound directly.

use std::io::Write;

use tracing::{debug, info_span};

use crate::driver::{BufferId, Driver, KernelArg, KernelId, NO_TIMEOUT};
use crate::kernels::COPY_KERNEL;
use crate::report;
use crate::session::{DeviceContext, Session};
use crate::timer::HostTimer;
use crate::{Error, PeerMeasurement, PeerMetric, PeerTransfer};

/// Bytes per copied element.
pub const ELEMENT_SIZE: usize = 8;

/// Buffer size and iteration counts of one peer measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerParams {
    pub elements: usize,
    pub warmup_iterations: u32,
    pub iterations: u32,
}

impl PeerParams {
    pub fn bandwidth() -> Self {
        Self {
            elements: 10_000_000,
            warmup_iterations: 5,
            iterations: 5,
        }
    }

    pub fn latency() -> Self {
        Self {
            elements: 1,
            warmup_iterations: 5,
            iterations: 100,
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.elements * ELEMENT_SIZE
    }
}

pub struct PeerBenchmark<'s, D: Driver> {
    session: &'s mut Session<D>,
    bandwidth: PeerParams,
    latency: PeerParams,
}

impl<'s, D: Driver> PeerBenchmark<'s, D> {
    pub fn new(session: &'s mut Session<D>) -> Self {
        Self {
            session,
            bandwidth: PeerParams::bandwidth(),
            latency: PeerParams::latency(),
        }
    }

    pub fn with_bandwidth_params(mut self, params: PeerParams) -> Self {
        self.bandwidth = params;
        self
    }

    pub fn with_latency_params(mut self, params: PeerParams) -> Self {
        self.latency = params;
        self
    }

    /// Measures copy bandwidth (GB/s) of every ordered device pair, writing
    /// each result line to `out` as soon as it is known.
    pub fn bandwidth(
        &mut self,
        bidirectional: bool,
        transfer: PeerTransfer,
        out: &mut dyn Write,
    ) -> Result<Vec<PeerMeasurement>, Error> {
        let params = self.bandwidth;
        self.run(PeerMetric::Bandwidth, params, bidirectional, transfer, out)
    }

    /// Measures the mean round trip (µs) of a single-element copy.
    pub fn latency(
        &mut self,
        bidirectional: bool,
        transfer: PeerTransfer,
        out: &mut dyn Write,
    ) -> Result<Vec<PeerMeasurement>, Error> {
        let params = self.latency;
        self.run(PeerMetric::Latency, params, bidirectional, transfer, out)
    }

    fn run(
        &mut self,
        metric: PeerMetric,
        params: PeerParams,
        bidirectional: bool,
        transfer: PeerTransfer,
        out: &mut dyn Write,
    ) -> Result<Vec<PeerMeasurement>, Error> {
        let test = test_name(metric);
        if !bidirectional && transfer == PeerTransfer::None {
            return Err(invalid_direction(metric));
        }
        if params.elements == 0 || params.iterations == 0 {
            return Err(Error::InvalidConfig(format!(
                "{} test needs at least one element and one iteration",
                test
            )));
        }

        let _span = info_span!("peer", ?metric, bidirectional, ?transfer).entered();
        let (driver, contexts) = self.session.split();

        let bytes = params.buffer_bytes();
        let mut buffers = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            match driver.allocate(ctx.device, bytes) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    let _ = free_all(driver, &buffers);
                    return Err(e);
                }
            }
        }
        debug!(devices = buffers.len(), bytes, "peer_buffers_allocated");

        let pass = PeerPass {
            metric,
            params,
            bidirectional,
            transfer,
            buffers: &buffers,
        };
        let mut measurements = Vec::new();
        let mut result = Ok(());
        for ctx in contexts {
            result = pass.measure_source(driver, ctx, out, &mut measurements);
            if result.is_err() {
                break;
            }
        }

        let freed = free_all(driver, &buffers);
        result?;
        freed?;
        Ok(measurements)
    }
}

/// The copy kernels of one source device and their group counts.
struct CopyLaunch {
    write_kernel: KernelId,
    read_kernel: Option<KernelId>,
    counts: [u32; 3],
}

struct PeerPass<'a> {
    metric: PeerMetric,
    params: PeerParams,
    bidirectional: bool,
    transfer: PeerTransfer,
    buffers: &'a [BufferId],
}

impl PeerPass<'_> {
    /// Runs source device `ctx` against every destination.
    fn measure_source<D: Driver>(
        &self,
        driver: &mut D,
        ctx: &DeviceContext,
        out: &mut dyn Write,
        measurements: &mut Vec<PeerMeasurement>,
    ) -> Result<(), Error> {
        let write_kernel = driver.create_kernel(ctx.module, COPY_KERNEL)?;
        let read_kernel = if self.bidirectional {
            match driver.create_kernel(ctx.module, COPY_KERNEL) {
                Ok(kernel) => Some(kernel),
                Err(e) => {
                    let _ = driver.destroy_kernel(write_kernel);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let result = self.measure_pairs(driver, ctx, write_kernel, read_kernel, out, measurements);

        let mut destroyed = driver.destroy_kernel(write_kernel);
        if let Some(kernel) = read_kernel {
            destroyed = destroyed.and(driver.destroy_kernel(kernel));
        }
        result?;
        destroyed
    }

    fn measure_pairs<D: Driver>(
        &self,
        driver: &mut D,
        ctx: &DeviceContext,
        write_kernel: KernelId,
        read_kernel: Option<KernelId>,
        out: &mut dyn Write,
        measurements: &mut Vec<PeerMeasurement>,
    ) -> Result<(), Error> {
        let elements = u32::try_from(self.params.elements)
            .map_err(|_| Error::InvalidConfig(format!("{} elements", self.params.elements)))?;
        let group_size = driver.suggest_group_size(write_kernel, [elements, 1, 1])?;
        driver.set_group_size(write_kernel, group_size)?;
        if let Some(kernel) = read_kernel {
            driver.set_group_size(kernel, group_size)?;
        }
        let counts = [
            (elements / group_size[0]).min(ctx.capability.max_group_count_x).max(1),
            1,
            1,
        ];
        debug!(device = ctx.device, ?group_size, ?counts, "copy_kernel_ready");
        let copy = CopyLaunch {
            write_kernel,
            read_kernel,
            counts,
        };

        let src = self.buffers[ctx.device];
        for (dst_device, &dst) in self.buffers.iter().enumerate() {
            // The list is reset after every pair, also when recording or
            // timing it failed, so the session stays usable.
            let timed = self
                .record_pair(driver, ctx, &copy, src, dst)
                .and_then(|()| driver.close_list(ctx.list))
                .and_then(|()| self.time_submissions(driver, ctx));
            let reset = driver.reset_list(ctx.list);
            let elapsed_usec = timed?;
            reset?;

            let value = match self.metric {
                PeerMetric::Bandwidth => bandwidth_gbps(
                    self.params.buffer_bytes(),
                    self.params.iterations,
                    self.bidirectional,
                    elapsed_usec / 1e6,
                ),
                PeerMetric::Latency => latency_usec(elapsed_usec, self.params.iterations),
            };
            let measurement = PeerMeasurement {
                src_device: ctx.device,
                dst_device,
                bidirectional: self.bidirectional,
                transfer: self.transfer,
                metric: self.metric,
                value,
            };
            writeln!(out, "{}", report::peer_line(&measurement))?;
            measurements.push(measurement);
        }
        Ok(())
    }

    /// Binds and appends the launches of one pair: `src` writes to `dst`,
    /// reads from it, or both.
    fn record_pair<D: Driver>(
        &self,
        driver: &mut D,
        ctx: &DeviceContext,
        copy: &CopyLaunch,
        src: BufferId,
        dst: BufferId,
    ) -> Result<(), Error> {
        if let Some(read_kernel) = copy.read_kernel {
            bind_copy(driver, copy.write_kernel, dst, src)?;
            bind_copy(driver, read_kernel, src, dst)?;
            driver.append_launch(ctx.list, copy.write_kernel, copy.counts, None)?;
            return driver.append_launch(ctx.list, read_kernel, copy.counts, None);
        }
        let (to, from) = match self.transfer {
            PeerTransfer::Write => (dst, src),
            PeerTransfer::Read => (src, dst),
            PeerTransfer::None => return Err(invalid_direction(self.metric)),
        };
        bind_copy(driver, copy.write_kernel, to, from)?;
        driver.append_launch(ctx.list, copy.write_kernel, copy.counts, None)
    }

    /// Host time in microseconds of the measured execute-then-sync rounds.
    fn time_submissions<D: Driver>(&self, driver: &mut D, ctx: &DeviceContext) -> Result<f64, Error> {
        for _ in 0..self.params.warmup_iterations {
            driver.execute_list(ctx.queue, ctx.list)?;
            driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
        }

        let mut timer = HostTimer::new();
        timer.start();
        for _ in 0..self.params.iterations {
            driver.execute_list(ctx.queue, ctx.list)?;
            driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
        }
        timer.end();
        Ok(timer.period_minus_overhead())
    }
}

fn test_name(metric: PeerMetric) -> &'static str {
    match metric {
        PeerMetric::Bandwidth => "Bandwidth",
        PeerMetric::Latency => "Latency",
    }
}

fn invalid_direction(metric: PeerMetric) -> Error {
    Error::InvalidArgument(format!(
        "{} test - transfer type parameter is invalid",
        test_name(metric)
    ))
}

fn bind_copy<D: Driver>(driver: &mut D, kernel: KernelId, dst: BufferId, src: BufferId) -> Result<(), Error> {
    driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(dst))?;
    driver.set_kernel_argument(kernel, 1, KernelArg::Buffer(src))
}

fn free_all<D: Driver>(driver: &mut D, buffers: &[BufferId]) -> Result<(), Error> {
    let mut result = Ok(());
    for &buffer in buffers {
        result = result.and(driver.free(buffer));
    }
    result
}

/// Gigabytes per second moved by `iterations` copies of `buffer_bytes`,
/// doubled when both directions run.
pub fn bandwidth_gbps(
    buffer_bytes: usize,
    iterations: u32,
    bidirectional: bool,
    elapsed_seconds: f64,
) -> f64 {
    let mut gigabytes = buffer_bytes as f64 * iterations as f64 / 1e9;
    if bidirectional {
        gigabytes *= 2.0;
    }
    gigabytes / elapsed_seconds
}

pub fn latency_usec(total_usec: f64, iterations: u32) -> f64 {
    total_usec / iterations as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelLibrary;
    use crate::sim::{SimConfig, SimDriver};

    fn small() -> PeerParams {
        PeerParams {
            elements: 4,
            warmup_iterations: 1,
            iterations: 2,
        }
    }

    fn session(devices: usize) -> Session<SimDriver> {
        Session::open(SimDriver::new(SimConfig::new(devices)), &KernelLibrary::builtin()).unwrap()
    }

    #[test]
    fn bandwidth_examples() {
        assert!((bandwidth_gbps(80_000_000, 5, false, 0.01) - 40.0).abs() < 1e-9);
        assert!((bandwidth_gbps(80_000_000, 5, true, 0.01) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn latency_example() {
        assert!((latency_usec(500.0, 100) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn default_params() {
        assert_eq!(PeerParams::bandwidth().buffer_bytes(), 80_000_000);
        assert_eq!(PeerParams::latency().iterations, 100);
        assert_eq!(PeerParams::latency().buffer_bytes(), 8);
    }

    #[test]
    fn every_ordered_pair_is_reported() {
        let mut session = session(3);
        let mut out = Vec::new();
        let results = PeerBenchmark::new(&mut session)
            .with_bandwidth_params(small())
            .bandwidth(false, PeerTransfer::Write, &mut out)
            .unwrap();

        let pairs: Vec<_> = results.iter().map(|m| (m.src_device, m.dst_device)).collect();
        assert_eq!(pairs.len(), 9);
        assert_eq!(pairs[0], (0, 0));
        assert_eq!(pairs[8], (2, 2));

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 9);
        assert!(text.lines().all(|l| l.contains("GBPS")));
        assert!(text.starts_with(" Device(0)->Device(0):  GBPS "));
    }

    #[test]
    fn one_buffer_per_device() {
        let mut session = session(4);
        let mut out = Vec::new();
        PeerBenchmark::new(&mut session)
            .latency(true, PeerTransfer::None, &mut out)
            .unwrap();
        let driver = session.driver();
        assert_eq!(driver.stats().allocations, 4);
        assert_eq!(driver.stats().frees, 4);
        assert_eq!(driver.live_buffers(), 0);
        assert_eq!(driver.live_kernels(), 0);
    }

    #[test]
    fn bidirectional_runs_two_launches_per_iteration() {
        let mut session = session(2);
        let mut out = Vec::new();
        PeerBenchmark::new(&mut session)
            .with_latency_params(small())
            .latency(true, PeerTransfer::None, &mut out)
            .unwrap();
        // 4 pairs, 3 submissions per pair, 2 launches per submission.
        assert_eq!(session.driver().stats().executions, 12);
        assert_eq!(session.driver().stats().launches, 24);
        assert!(String::from_utf8(out).unwrap().contains("<->"));
    }

    #[test]
    fn unidirectional_without_direction_is_rejected() {
        let mut session = session(2);
        let mut out = Vec::new();
        let err = PeerBenchmark::new(&mut session)
            .bandwidth(false, PeerTransfer::None, &mut out)
            .unwrap_err();
        match err {
            Error::InvalidArgument(msg) => assert!(msg.contains("transfer type parameter is invalid")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.is_empty());
        assert_eq!(session.driver().stats().allocations, 0);
    }

    #[test]
    fn kernel_failure_still_frees_buffers() {
        let mut session = session(2);
        let mut out = Vec::new();
        let (driver, _) = session.split();
        driver.fail_on("create_kernel", crate::ResultCode::OutOfDeviceMemory);
        let err = PeerBenchmark::new(&mut session)
            .with_bandwidth_params(small())
            .bandwidth(false, PeerTransfer::Read, &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::Driver { op: "create_kernel", .. }));
        assert_eq!(session.driver().live_buffers(), 0);
    }

    #[test]
    fn latency_without_direction_is_rejected() {
        let mut session = session(2);
        let mut out = Vec::new();
        let err = PeerBenchmark::new(&mut session)
            .latency(false, PeerTransfer::None, &mut out)
            .unwrap_err();
        match err {
            Error::InvalidArgument(msg) => {
                assert_eq!(msg, "Latency test - transfer type parameter is invalid")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.is_empty());
        assert_eq!(session.driver().stats().allocations, 0);
    }

    #[test]
    fn failed_pair_leaves_the_list_reusable() {
        let mut session = session(2);
        let mut out = Vec::new();
        session.split().0.fail_after("execute_list", 1, crate::ResultCode::DeviceLost);
        let err = PeerBenchmark::new(&mut session)
            .with_latency_params(small())
            .latency(false, PeerTransfer::Write, &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::Driver { op: "execute_list", .. }));

        session.split().0.clear_faults();
        let results = PeerBenchmark::new(&mut session)
            .with_latency_params(small())
            .latency(false, PeerTransfer::Write, &mut out)
            .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(session.driver().live_buffers(), 0);
    }
}
