use std::io::Write;

use tracing::info;
use ze_bench::{Driver, Error, PeakBenchmark, Session, TimingEngine};

use crate::config::Config;
use crate::harness::Reporter;

pub fn run<D: Driver>(
    session: &mut Session<D>,
    config: &Config,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let mut reporter = Reporter::new(config.format);
    let device = if config.device < session.device_count() {
        config.device
    } else {
        reporter.text(
            out,
            &format!(
                "Specified device {} is not valid, will default to the first device",
                config.device
            ),
        )?;
        0
    };

    let capability = &session.context(device).capability;
    reporter.text(out, "Device : ")?;
    reporter.text(out, &format!(" * name : {}", capability.name))?;
    reporter.text(out, &format!(" * compute units : {}", capability.compute_units))?;
    reporter.text(out, &format!(" * max group size : {:?}", capability.max_group_size()))?;
    reporter.text(out, &format!(" * kernel timestamps : {}", capability.kernel_timestamps))?;
    reporter.text(out, "")?;
    info!(device, tests = ?config.tests, "peak_suite_start");

    let engine = TimingEngine::new(config.warmup, config.iters)?;
    let mut peak = PeakBenchmark::new(session, device, engine).with_event_timer(config.event_timer);
    for test in &config.tests {
        let results = peak.run(test, reporter.lines(&mut *out))?;
        reporter.finish(out, &results)?;
    }
    Ok(())
}
