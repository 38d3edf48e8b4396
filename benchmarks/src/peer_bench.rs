use std::io::Write;

use tracing::info;
use ze_bench::peer::PeerParams;
use ze_bench::report::peer_header;
use ze_bench::{Driver, Error, PeerBenchmark, PeerMetric, PeerTransfer, Session};

use crate::config::Config;
use crate::harness::Reporter;

/// Write, read, then both directions.
const DEFAULT_RUNS: [(bool, PeerTransfer); 3] = [
    (false, PeerTransfer::Write),
    (false, PeerTransfer::Read),
    (true, PeerTransfer::None),
];

fn selected_runs(config: &Config) -> Vec<(bool, PeerTransfer)> {
    match config.transfer {
        Some(transfer) => vec![(config.bidirectional, transfer)],
        None if config.bidirectional => vec![(true, PeerTransfer::None)],
        None => DEFAULT_RUNS.to_vec(),
    }
}

pub fn run<D: Driver>(
    session: &mut Session<D>,
    config: &Config,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let mut reporter = Reporter::new(config.format);
    let mut bandwidth = PeerParams::bandwidth();
    if let Some(elements) = config.elements {
        bandwidth.elements = elements;
    }
    info!(devices = session.device_count(), elements = bandwidth.elements, "peer_suite_start");

    let runs = selected_runs(config);
    let mut peer = PeerBenchmark::new(session).with_bandwidth_params(bandwidth);
    for metric in [PeerMetric::Bandwidth, PeerMetric::Latency] {
        for &(bidirectional, transfer) in &runs {
            reporter.text(out, &peer_header(metric, bidirectional, transfer))?;
            let lines = reporter.lines(&mut *out);
            let results = match metric {
                PeerMetric::Bandwidth => peer.bandwidth(bidirectional, transfer, lines)?,
                PeerMetric::Latency => peer.latency(bidirectional, transfer, lines)?,
            };
            reporter.finish(out, &results)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flags_narrow_the_runs() {
        let mut config = Config::default();
        assert_eq!(selected_runs(&config).len(), 3);

        config.bidirectional = true;
        assert_eq!(selected_runs(&config), [(true, PeerTransfer::None)]);

        config.bidirectional = false;
        config.transfer = Some(PeerTransfer::Read);
        assert_eq!(selected_runs(&config), [(false, PeerTransfer::Read)]);
    }
}
