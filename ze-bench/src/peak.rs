//! Single-device peak tests: global memory bandwidth, compute throughput at
//! each precision, host transfer bandwidth and kernel launch latency.

use std::io::Write;

use tracing::{debug, info_span, warn};

use crate::driver::{BufferId, Driver, KernelArg, KernelId};
use crate::kernels::{
    compute_dp_name, compute_hp_name, compute_int_name, compute_sp_name, global_bandwidth_name,
    KernelFeature, FETCHES_PER_ITEM, KERNEL_LATENCY, OPS_PER_ITEM, VECTOR_WIDTHS,
};
use crate::report;
use crate::session::{DeviceContext, Session};
use crate::timing::TimingEngine;
use crate::workgroups::{max_work_items, solve};
use crate::{Error, PeakMeasurement, TimingMode};

/// Work items per hardware thread slot in the compute tests.
const COMPUTE_ITEMS_PER_SLOT: u64 = 128;
const SCALAR_BYTES: u64 = 4;

pub const GLOBAL_BW: &str = "global_bw";
pub const HP_COMPUTE: &str = "hp_compute";
pub const SP_COMPUTE: &str = "sp_compute";
pub const DP_COMPUTE: &str = "dp_compute";
pub const INT_COMPUTE: &str = "int_compute";
pub const TRANSFER_BW: &str = "transfer_bw";
pub const KERNEL_LAT: &str = "kernel_lat";

/// Every test, in the order a full run performs them.
pub const ALL_TESTS: [&str; 7] = [
    GLOBAL_BW,
    HP_COMPUTE,
    SP_COMPUTE,
    DP_COMPUTE,
    INT_COMPUTE,
    TRANSFER_BW,
    KERNEL_LAT,
];

pub struct PeakBenchmark<'s, D: Driver> {
    session: &'s mut Session<D>,
    device: usize,
    engine: TimingEngine,
    event_timer: bool,
}

impl<'s, D: Driver> PeakBenchmark<'s, D> {
    /// Targets `device`, or the first device when the index is out of range.
    pub fn new(session: &'s mut Session<D>, device: usize, engine: TimingEngine) -> Self {
        let device = if device < session.device_count() {
            device
        } else {
            warn!(device, "invalid device index, using device 0");
            0
        };
        Self {
            session,
            device,
            engine,
            event_timer: false,
        }
    }

    /// Times the bandwidth test with kernel timestamps instead of the host clock.
    pub fn with_event_timer(mut self, event_timer: bool) -> Self {
        self.event_timer = event_timer;
        self
    }

    pub fn device(&self) -> usize {
        self.device
    }

    /// Runs the named test; unknown names are rejected.
    pub fn run(&mut self, test: &str, out: &mut dyn Write) -> Result<Vec<PeakMeasurement>, Error> {
        let _span = info_span!("peak", test, device = self.device).entered();
        writeln!(out, "{}", report::peak_header(test))?;
        let results = match test {
            GLOBAL_BW => self.global_bandwidth(out)?,
            HP_COMPUTE => self.compute(ComputeKind::HalfPrecision, out)?,
            SP_COMPUTE => self.compute(ComputeKind::SinglePrecision, out)?,
            DP_COMPUTE => self.compute(ComputeKind::DoublePrecision, out)?,
            INT_COMPUTE => self.compute(ComputeKind::Integer, out)?,
            TRANSFER_BW => self.transfer_bandwidth(out)?,
            KERNEL_LAT => self.kernel_latency(out)?,
            other => return Err(Error::InvalidArgument(format!("unknown peak test {}", other))),
        };
        writeln!(out, "{}", report::PEAK_TEST_COMPLETE)?;
        Ok(results)
    }

    fn global_bandwidth(&mut self, out: &mut dyn Write) -> Result<Vec<PeakMeasurement>, Error> {
        let mode = if self.event_timer {
            TimingMode::BandwidthEventTiming
        } else {
            TimingMode::Bandwidth
        };
        let engine = self.engine;
        let (driver, contexts) = self.session.split();
        let ctx = &contexts[self.device];

        let mut floats = (max_work_items(&ctx.capability) * FETCHES_PER_ITEM)
            .min(ctx.capability.max_alloc_size / SCALAR_BYTES);
        floats -= floats % 4;
        if floats == 0 {
            return Err(Error::InvalidConfig(
                "device cannot hold the bandwidth input buffer".into(),
            ));
        }
        let input = driver.allocate(ctx.device, (floats * SCALAR_BYTES) as usize)?;
        debug!(floats, "bandwidth_input_allocated");

        let mut results = Vec::new();
        let mut outcome = Ok(());
        for width in VECTOR_WIDTHS {
            let items = floats / (FETCHES_PER_ITEM * width as u64);
            let variant = VariantRun {
                kernel: global_bandwidth_name(width),
                items,
                mode,
            };
            outcome = variant
                .run(driver, ctx, &engine, |driver, kernel, output| {
                    driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(input))?;
                    driver.set_kernel_argument(kernel, 1, KernelArg::Buffer(output))
                })
                .and_then(|(usec, executed)| {
                    let bytes = executed * FETCHES_PER_ITEM * width as u64 * SCALAR_BYTES;
                    let m = measurement(GLOBAL_BW, vector_variant("float", width), gbps(bytes, usec), "GBPS");
                    writeln!(out, "{}", report::peak_line(&m))?;
                    results.push(m);
                    Ok(())
                });
            if outcome.is_err() {
                break;
            }
        }

        let freed = driver.free(input);
        outcome?;
        freed?;
        Ok(results)
    }

    fn compute(&mut self, kind: ComputeKind, out: &mut dyn Write) -> Result<Vec<PeakMeasurement>, Error> {
        let engine = self.engine;
        let (driver, contexts) = self.session.split();
        let ctx = &contexts[self.device];
        if let Some(feature) = kind.feature() {
            if !feature.supported_by(&ctx.capability) {
                writeln!(
                    out,
                    "{:>24} : unsupported (no {} support)",
                    kind.scalar_name(),
                    feature_name(feature)
                )?;
                return Ok(Vec::new());
            }
        }
        let items = max_work_items(&ctx.capability) * COMPUTE_ITEMS_PER_SLOT;

        let mut results = Vec::new();
        for width in VECTOR_WIDTHS {
            let variant = VariantRun {
                kernel: kind.kernel_name(width),
                items,
                mode: TimingMode::Bandwidth,
            };
            let scalar = kind.scalar_argument();
            let (usec, executed) = variant.run(driver, ctx, &engine, |driver, kernel, output| {
                driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(output))?;
                driver.set_kernel_argument(kernel, 1, KernelArg::Bytes(&scalar))
            })?;
            let ops = executed * OPS_PER_ITEM * width as u64;
            let m = measurement(
                kind.test(),
                vector_variant(kind.scalar_name(), width),
                ops as f64 / usec / 1e3,
                kind.unit(),
            );
            writeln!(out, "{}", report::peak_line(&m))?;
            results.push(m);
        }
        Ok(results)
    }

    /// Host to device and device to host copies of one buffer, host timed.
    fn transfer_bandwidth(&mut self, out: &mut dyn Write) -> Result<Vec<PeakMeasurement>, Error> {
        let engine = self.engine;
        let (driver, contexts) = self.session.split();
        let ctx = &contexts[self.device];

        let bytes = (max_work_items(&ctx.capability) * FETCHES_PER_ITEM * SCALAR_BYTES)
            .min(ctx.capability.max_alloc_size);
        let bytes = bytes - bytes % SCALAR_BYTES;
        if bytes == 0 {
            return Err(Error::InvalidConfig(
                "device cannot hold the transfer buffer".into(),
            ));
        }
        let buffer = driver.allocate(ctx.device, bytes as usize)?;
        let mut host: Vec<u8> = (0..bytes).map(|i| i as u8).collect();
        debug!(bytes, "transfer_buffer_allocated");

        let mut results = Vec::new();
        let mut outcome = Ok(());
        for (variant, to_device) in [("host_to_device", true), ("device_to_host", false)] {
            outcome = engine
                .run_transfer(driver, |driver| {
                    if to_device {
                        driver.write_buffer(buffer, 0, &host)
                    } else {
                        driver.read_buffer(buffer, 0, &mut host)
                    }
                })
                .and_then(|usec| {
                    let m = measurement(TRANSFER_BW, variant.to_string(), gbps(bytes, usec), "GBPS");
                    writeln!(out, "{}", report::peak_line(&m))?;
                    results.push(m);
                    Ok(())
                });
            if outcome.is_err() {
                break;
            }
        }

        let freed = driver.free(buffer);
        outcome?;
        freed?;
        Ok(results)
    }

    fn kernel_latency(&mut self, out: &mut dyn Write) -> Result<Vec<PeakMeasurement>, Error> {
        let engine = self.engine;
        let (driver, contexts) = self.session.split();
        let ctx = &contexts[self.device];

        let mut modes = vec![("launch_latency", TimingMode::KernelLaunchLatency)];
        if ctx.capability.kernel_timestamps {
            modes.push(("complete_runtime", TimingMode::KernelCompleteRuntime));
        }

        let mut results = Vec::new();
        for (variant, mode) in modes {
            let run = VariantRun {
                kernel: KERNEL_LATENCY.to_string(),
                items: 1,
                mode,
            };
            let (usec, _) = run.run(driver, ctx, &engine, |driver, kernel, output| {
                driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(output))
            })?;
            let m = measurement(KERNEL_LAT, variant.to_string(), usec, "uS");
            writeln!(out, "{}", report::peak_line(&m))?;
            results.push(m);
        }
        if !ctx.capability.kernel_timestamps {
            writeln!(out, "{:>24} : unsupported (no kernel timestamps)", "complete_runtime")?;
        }
        Ok(results)
    }
}

#[derive(Clone, Copy, Debug)]
enum ComputeKind {
    HalfPrecision,
    SinglePrecision,
    DoublePrecision,
    Integer,
}

impl ComputeKind {
    fn kernel_name(self, width: u32) -> String {
        match self {
            ComputeKind::HalfPrecision => compute_hp_name(width),
            ComputeKind::SinglePrecision => compute_sp_name(width),
            ComputeKind::DoublePrecision => compute_dp_name(width),
            ComputeKind::Integer => compute_int_name(width),
        }
    }

    fn feature(self) -> Option<KernelFeature> {
        match self {
            ComputeKind::HalfPrecision => Some(KernelFeature::Fp16),
            ComputeKind::DoublePrecision => Some(KernelFeature::Fp64),
            ComputeKind::SinglePrecision | ComputeKind::Integer => None,
        }
    }

    /// Half precision takes its scalar widened to f32.
    fn scalar_argument(self) -> Vec<u8> {
        match self {
            ComputeKind::HalfPrecision | ComputeKind::SinglePrecision => 1.3f32.to_le_bytes().to_vec(),
            ComputeKind::DoublePrecision => 1.3f64.to_le_bytes().to_vec(),
            ComputeKind::Integer => 4i32.to_le_bytes().to_vec(),
        }
    }

    fn test(self) -> &'static str {
        match self {
            ComputeKind::HalfPrecision => HP_COMPUTE,
            ComputeKind::SinglePrecision => SP_COMPUTE,
            ComputeKind::DoublePrecision => DP_COMPUTE,
            ComputeKind::Integer => INT_COMPUTE,
        }
    }

    fn scalar_name(self) -> &'static str {
        match self {
            ComputeKind::HalfPrecision => "half",
            ComputeKind::SinglePrecision => "float",
            ComputeKind::DoublePrecision => "double",
            ComputeKind::Integer => "int",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            ComputeKind::Integer => "GIOPS",
            _ => "GFLOPS",
        }
    }
}

fn feature_name(feature: KernelFeature) -> &'static str {
    match feature {
        KernelFeature::Fp16 => "fp16",
        KernelFeature::Fp64 => "fp64",
    }
}

/// One kernel timed once over a solved plan, with a scratch output buffer.
struct VariantRun {
    kernel: String,
    items: u64,
    mode: TimingMode,
}

impl VariantRun {
    /// Returns the mean duration (µs) and the executed work-item count.
    fn run<D, F>(
        &self,
        driver: &mut D,
        ctx: &DeviceContext,
        engine: &TimingEngine,
        bind: F,
    ) -> Result<(f64, u64), Error>
    where
        D: Driver,
        F: FnOnce(&mut D, KernelId, BufferId) -> Result<(), Error>,
    {
        let (plan, executed) = solve(self.items, &ctx.capability);
        debug!(kernel = %self.kernel, requested = self.items, executed, "variant_planned");

        let output_bytes = (executed * SCALAR_BYTES).min(ctx.capability.max_alloc_size);
        let output = driver.allocate(ctx.device, output_bytes as usize)?;
        let kernel = match driver.create_kernel(ctx.module, &self.kernel) {
            Ok(kernel) => kernel,
            Err(e) => {
                let _ = driver.free(output);
                return Err(e);
            }
        };

        let timed = bind(driver, kernel, output)
            .and_then(|()| engine.run_kernel(driver, ctx, kernel, &plan, self.mode, true));

        let destroyed = driver.destroy_kernel(kernel);
        let freed = driver.free(output);
        let usec = timed?;
        destroyed?;
        freed?;
        Ok((usec, executed))
    }
}

fn measurement(test: &str, variant: String, value: f64, unit: &str) -> PeakMeasurement {
    PeakMeasurement {
        test: test.to_string(),
        variant,
        value,
        unit: unit.to_string(),
    }
}

fn vector_variant(scalar: &str, width: u32) -> String {
    if width == 1 {
        scalar.to_string()
    } else {
        format!("{}{}", scalar, width)
    }
}

/// `bytes` moved in `usec` microseconds, as GB/s.
pub fn gbps(bytes: u64, usec: f64) -> f64 {
    bytes as f64 / usec / 1e3
}
