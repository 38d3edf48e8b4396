//! Kernel timing under the four measurement strategies.
//!
//! Each strategy owns its event pool for the duration of one call; the pool
//! and event are destroyed before `run_kernel` returns, whatever the outcome.

use tracing::{debug, debug_span};

use crate::driver::{Driver, EventId, EventPoolFlags, KernelId, NO_TIMEOUT};
use crate::session::DeviceContext;
use crate::timer::HostTimer;
use crate::{DeviceCapability, Error, KernelTimestamp, TimingMode, WorkgroupPlan};

pub const DEFAULT_WARMUP_ITERATIONS: u32 = 10;
pub const DEFAULT_ITERS: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingEngine {
    warmup_iterations: u32,
    iters: u32,
}

impl Default for TimingEngine {
    fn default() -> Self {
        Self {
            warmup_iterations: DEFAULT_WARMUP_ITERATIONS,
            iters: DEFAULT_ITERS,
        }
    }
}

impl TimingEngine {
    pub fn new(warmup_iterations: u32, iters: u32) -> Result<Self, Error> {
        if iters == 0 {
            return Err(Error::InvalidConfig("iters must be at least 1".into()));
        }
        Ok(Self {
            warmup_iterations,
            iters,
        })
    }

    pub fn warmup_iterations(&self) -> u32 {
        self.warmup_iterations
    }

    pub fn iters(&self) -> u32 {
        self.iters
    }

    /// Runs `kernel` with `plan` and returns the mean duration of the measured
    /// iterations in microseconds.
    ///
    /// The command list of `ctx` must be empty on entry. When
    /// `reset_list_after` is false the caller owns resetting it.
    pub fn run_kernel<D: Driver>(
        &self,
        driver: &mut D,
        ctx: &DeviceContext,
        kernel: KernelId,
        plan: &WorkgroupPlan,
        mode: TimingMode,
        reset_list_after: bool,
    ) -> Result<f64, Error> {
        let _span = debug_span!("run_kernel", device = ctx.device, ?mode).entered();

        driver.set_group_size(kernel, plan.group_size())?;
        debug!(group_size = ?plan.group_size(), "group_size_set");

        let launch = Launch {
            ctx,
            kernel,
            counts: plan.group_count(),
        };
        let total_usec = match mode {
            TimingMode::Bandwidth => self.bandwidth(driver, &launch)?,
            TimingMode::BandwidthEventTiming => self.bandwidth_event_timing(driver, &launch)?,
            TimingMode::KernelLaunchLatency => self.kernel_launch_latency(driver, &launch)?,
            TimingMode::KernelCompleteRuntime => self.kernel_complete_runtime(driver, &launch)?,
        };

        if reset_list_after {
            driver.reset_list(ctx.list)?;
            debug!("command_list_reset");
        }

        let mean = total_usec / self.iters as f64;
        debug!(mean_usec = mean, iters = self.iters, "kernel_timed");
        Ok(mean)
    }

    /// Runs a blocking host transfer `warmup_iterations + iters` times and
    /// returns the mean host time of the measured runs in microseconds.
    pub fn run_transfer<D: Driver>(
        &self,
        driver: &mut D,
        mut transfer: impl FnMut(&mut D) -> Result<(), Error>,
    ) -> Result<f64, Error> {
        let _span = debug_span!("run_transfer").entered();
        for _ in 0..self.warmup_iterations {
            transfer(driver)?;
        }

        let mut timer = HostTimer::new();
        timer.start();
        for _ in 0..self.iters {
            transfer(driver)?;
        }
        let mean = timer.stop_and_time() / self.iters as f64;
        debug!(mean_usec = mean, iters = self.iters, "transfer_timed");
        Ok(mean)
    }

    fn bandwidth<D: Driver>(&self, driver: &mut D, launch: &Launch<'_>) -> Result<f64, Error> {
        let ctx = launch.ctx;
        driver.append_launch(ctx.list, launch.kernel, launch.counts, None)?;
        driver.close_list(ctx.list)?;

        for _ in 0..self.warmup_iterations {
            driver.execute_list(ctx.queue, ctx.list)?;
        }
        driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;

        let mut timer = HostTimer::new();
        timer.start();
        for _ in 0..self.iters {
            driver.execute_list(ctx.queue, ctx.list)?;
        }
        driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
        Ok(timer.stop_and_time())
    }

    fn bandwidth_event_timing<D: Driver>(
        &self,
        driver: &mut D,
        launch: &Launch<'_>,
    ) -> Result<f64, Error> {
        let ctx = launch.ctx;
        let flags = EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP;
        with_event(driver, ctx, flags, |driver, event| {
            driver.append_launch(ctx.list, launch.kernel, launch.counts, Some(event))?;
            driver.close_list(ctx.list)?;

            for _ in 0..self.warmup_iterations {
                driver.execute_list(ctx.queue, ctx.list)?;
                driver.host_wait(event, NO_TIMEOUT)?;
                driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
                driver.host_reset(event)?;
            }

            let mut total = 0.0;
            for _ in 0..self.iters {
                driver.execute_list(ctx.queue, ctx.list)?;
                driver.host_wait(event, NO_TIMEOUT)?;
                total += device_elapsed_usec(driver.query_timestamp(event)?, &ctx.capability);
                driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
                driver.host_reset(event)?;
            }
            Ok(total)
        })
    }

    fn kernel_launch_latency<D: Driver>(
        &self,
        driver: &mut D,
        launch: &Launch<'_>,
    ) -> Result<f64, Error> {
        let ctx = launch.ctx;
        with_event(driver, ctx, EventPoolFlags::HOST_VISIBLE, |driver, event| {
            driver.append_signal_event(ctx.list, event)?;
            driver.append_launch(ctx.list, launch.kernel, launch.counts, None)?;
            driver.close_list(ctx.list)?;

            for _ in 0..self.warmup_iterations {
                driver.execute_list(ctx.queue, ctx.list)?;
                driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
                driver.host_wait(event, NO_TIMEOUT)?;
                driver.host_reset(event)?;
            }

            let mut timer = HostTimer::new();
            let mut total = 0.0;
            for _ in 0..self.iters {
                timer.start();
                driver.execute_list(ctx.queue, ctx.list)?;
                driver.host_wait(event, NO_TIMEOUT)?;
                total += timer.stop_and_time();

                driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
                driver.host_reset(event)?;
            }
            Ok(total)
        })
    }

    fn kernel_complete_runtime<D: Driver>(
        &self,
        driver: &mut D,
        launch: &Launch<'_>,
    ) -> Result<f64, Error> {
        let ctx = launch.ctx;
        let flags = EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP;
        with_event(driver, ctx, flags, |driver, event| {
            driver.append_launch(ctx.list, launch.kernel, launch.counts, Some(event))?;
            driver.close_list(ctx.list)?;

            for _ in 0..self.warmup_iterations {
                driver.execute_list(ctx.queue, ctx.list)?;
                driver.host_wait(event, NO_TIMEOUT)?;
                driver.host_reset(event)?;
            }
            driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;

            let mut total = 0.0;
            for _ in 0..self.iters {
                driver.execute_list(ctx.queue, ctx.list)?;
                driver.synchronize_queue(ctx.queue, NO_TIMEOUT)?;
                driver.host_wait(event, NO_TIMEOUT)?;
                total += device_elapsed_usec(driver.query_timestamp(event)?, &ctx.capability);
                driver.host_reset(event)?;
            }
            Ok(total)
        })
    }
}

struct Launch<'a> {
    ctx: &'a DeviceContext,
    kernel: KernelId,
    counts: [u32; 3],
}

fn with_event<D, T>(
    driver: &mut D,
    ctx: &DeviceContext,
    flags: EventPoolFlags,
    body: impl FnOnce(&mut D, EventId) -> Result<T, Error>,
) -> Result<T, Error>
where
    D: Driver,
{
    let pool = driver.create_event_pool(ctx.device, flags, 1)?;
    let event = match driver.create_event(pool, 0) {
        Ok(event) => event,
        Err(e) => {
            let _ = driver.destroy_event_pool(pool);
            return Err(e);
        }
    };
    debug!(?flags, "event_created");

    let result = body(driver, event);
    let event_destroyed = driver.destroy_event(event);
    let pool_destroyed = driver.destroy_event_pool(pool);

    let value = result?;
    event_destroyed?;
    pool_destroyed?;
    Ok(value)
}

/// Largest tick value a timestamp with `valid_bits` significant bits holds.
pub fn timestamp_max_value(valid_bits: u32) -> u64 {
    if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    }
}

/// Ticks between `start` and `end`, allowing for one counter wrap.
pub fn elapsed_ticks(start: u64, end: u64, max_value: u64) -> u64 {
    if end >= start {
        end - start
    } else {
        (max_value - start) + end + 1
    }
}

pub fn device_elapsed_usec(ts: KernelTimestamp, capability: &DeviceCapability) -> f64 {
    let max_value = timestamp_max_value(capability.kernel_timestamp_valid_bits);
    let ticks = elapsed_ticks(ts.start, ts.end, max_value);
    ticks as f64 * capability.timer_resolution_ns / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{KernelLibrary, KERNEL_LATENCY};
    use crate::session::Session;
    use crate::sim::{SimConfig, SimDriver};
    use crate::ResultCode;

    fn session(launch_ticks: Vec<u64>) -> Session<SimDriver> {
        let mut config = SimConfig::new(1);
        config.launch_ticks = launch_ticks;
        Session::open(SimDriver::new(config), &KernelLibrary::builtin()).unwrap()
    }

    fn plan() -> WorkgroupPlan {
        WorkgroupPlan {
            group_size_x: 1,
            group_size_y: 1,
            group_size_z: 1,
            group_count_x: 1,
            group_count_y: 1,
            group_count_z: 1,
        }
    }

    fn latency_kernel(session: &mut Session<SimDriver>) -> KernelId {
        let (driver, contexts) = session.split();
        let module = contexts[0].module;
        let device = contexts[0].device;
        let kernel = driver.create_kernel(module, KERNEL_LATENCY).unwrap();
        let buffer = driver.allocate(device, 64).unwrap();
        driver
            .set_kernel_argument(kernel, 0, crate::driver::KernelArg::Buffer(buffer))
            .unwrap();
        kernel
    }

    #[test]
    fn wraparound_uses_max_value() {
        assert_eq!(elapsed_ticks(10, 5, 15), 11);
        assert_eq!(elapsed_ticks(5, 10, 15), 5);
        assert_eq!(timestamp_max_value(4), 15);
        assert_eq!(timestamp_max_value(64), u64::MAX);
        assert_eq!(elapsed_ticks(u64::MAX, 0, u64::MAX), 1);
    }

    #[test]
    fn device_time_scales_by_resolution() {
        let mut cap = SimConfig::new(1).capability;
        cap.timer_resolution_ns = 80.0;
        cap.kernel_timestamp_valid_bits = 4;
        let usec = device_elapsed_usec(KernelTimestamp { start: 10, end: 5 }, &cap);
        assert!((usec - 11.0 * 80.0 / 1000.0).abs() < 1e-12);
    }

    #[test]
    fn iters_must_be_positive() {
        assert!(TimingEngine::new(3, 0).is_err());
        let engine = TimingEngine::new(0, 1).unwrap();
        assert_eq!(engine.warmup_iterations(), 0);
        assert_eq!(engine.iters(), 1);
    }

    #[test]
    fn event_timing_excludes_warmup_launches() {
        // Two slow warm-up launches, then three measured launches of 10 ticks.
        let mut session = session(vec![5000, 5000, 10]);
        let kernel = latency_kernel(&mut session);
        let engine = TimingEngine::new(2, 3).unwrap();
        let (driver, contexts) = session.split();
        let mean = engine
            .run_kernel(driver, &contexts[0], kernel, &plan(), TimingMode::BandwidthEventTiming, true)
            .unwrap();
        assert!((mean - 0.01).abs() < 1e-12, "mean {}", mean);
        assert_eq!(driver.stats().launches, 5);
        assert_eq!(driver.stats().executions, 5);
        assert_eq!(driver.live_events(), 0);
        assert_eq!(driver.live_pools(), 0);
    }

    #[test]
    fn complete_runtime_reads_device_time() {
        let mut session = session(vec![2000]);
        let kernel = latency_kernel(&mut session);
        let engine = TimingEngine::new(1, 4).unwrap();
        let (driver, contexts) = session.split();
        let mean = engine
            .run_kernel(driver, &contexts[0], kernel, &plan(), TimingMode::KernelCompleteRuntime, true)
            .unwrap();
        assert!((mean - 2.0).abs() < 1e-12);
        assert_eq!(driver.stats().executions, 5);
    }

    #[test]
    fn host_timed_modes_are_non_negative() {
        let mut session = session(vec![100]);
        let kernel = latency_kernel(&mut session);
        let engine = TimingEngine::new(2, 5).unwrap();
        let (driver, contexts) = session.split();
        for mode in [TimingMode::Bandwidth, TimingMode::KernelLaunchLatency] {
            let before = driver.stats().executions;
            let mean = engine
                .run_kernel(driver, &contexts[0], kernel, &plan(), mode, true)
                .unwrap();
            assert!(mean >= 0.0);
            assert_eq!(driver.stats().executions - before, 7);
        }
        assert_eq!(driver.live_events(), 0);
    }

    #[test]
    fn list_is_left_closed_without_reset() {
        let mut session = session(vec![1]);
        let kernel = latency_kernel(&mut session);
        let engine = TimingEngine::new(0, 1).unwrap();
        let (driver, contexts) = session.split();
        engine
            .run_kernel(driver, &contexts[0], kernel, &plan(), TimingMode::Bandwidth, false)
            .unwrap();
        let err = engine
            .run_kernel(driver, &contexts[0], kernel, &plan(), TimingMode::Bandwidth, false)
            .unwrap_err();
        assert!(matches!(err, Error::Driver { op: "append_launch", .. }));
        driver.reset_list(contexts[0].list).unwrap();
    }

    #[test]
    fn failed_wait_still_releases_the_event_pool() {
        let mut session = session(vec![1]);
        let kernel = latency_kernel(&mut session);
        let engine = TimingEngine::new(1, 1).unwrap();
        let (driver, contexts) = session.split();
        driver.fail_on("host_wait", ResultCode::DeviceLost);
        let err = engine
            .run_kernel(driver, &contexts[0], kernel, &plan(), TimingMode::KernelLaunchLatency, true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Driver { op: "host_wait", code: ResultCode::DeviceLost }
        ));
        assert_eq!(driver.live_events(), 0);
        assert_eq!(driver.live_pools(), 0);
    }

    #[test]
    fn timestamp_pool_requires_device_support() {
        let mut config = SimConfig::new(1);
        config.capability.kernel_timestamps = false;
        let mut session = Session::open(SimDriver::new(config), &KernelLibrary::builtin()).unwrap();
        let kernel = latency_kernel(&mut session);
        let engine = TimingEngine::default();
        let (driver, contexts) = session.split();
        let err = engine
            .run_kernel(driver, &contexts[0], kernel, &plan(), TimingMode::BandwidthEventTiming, true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Driver { op: "create_event_pool", code: ResultCode::UnsupportedFeature }
        ));
    }

    #[test]
    fn transfer_runs_warmup_then_measured_copies() {
        let mut session = session(vec![1]);
        let (driver, contexts) = session.split();
        let buffer = driver.allocate(contexts[0].device, 64).unwrap();
        let data = [1u8; 64];
        let mean = TimingEngine::new(3, 4)
            .unwrap()
            .run_transfer(driver, |driver| driver.write_buffer(buffer, 0, &data))
            .unwrap();
        assert!(mean >= 0.0);
        assert_eq!(driver.stats().host_copies, 7);
    }

    #[test]
    fn transfer_failure_stops_the_run() {
        let mut session = session(vec![1]);
        let (driver, contexts) = session.split();
        let buffer = driver.allocate(contexts[0].device, 64).unwrap();
        driver.fail_on("read_buffer", ResultCode::DeviceLost);
        let mut out = [0u8; 64];
        let err = TimingEngine::default()
            .run_transfer(driver, |driver| driver.read_buffer(buffer, 0, &mut out))
            .unwrap_err();
        assert!(matches!(err, Error::Driver { op: "read_buffer", code: ResultCode::DeviceLost }));
    }
}
