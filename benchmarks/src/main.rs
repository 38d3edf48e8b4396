mod config;
mod harness;
mod peak_bench;
mod peer_bench;

use config::{Backend, Config};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use ze_bench::sim::SimConfig;
use ze_bench::{Driver, Error, KernelLibrary, Session, SimDriver, WgpuDriver};

fn print_usage() {
    eprintln!("Usage: benchmarks [OPTIONS]");
    eprintln!();
    eprintln!("  --bench <name>        Suite to run: peer, peak, all (default: all)");
    eprintln!("  --backend <name>      Driver: wgpu, sim (default: wgpu)");
    eprintln!("  -p, --platform <name> wgpu backends: primary, all, vulkan, metal, dx12, gl (default: primary)");
    eprintln!("  --devices <n>         Devices in the group (default: 1 for wgpu, 2 for sim)");
    eprintln!("  -d, --device <n>      Device for the peak tests (default: 0)");
    eprintln!("  --compute-units <n>   Override the compute unit count of every device");
    eprintln!("  -t <tests>            Peak tests: global_bw, hp_compute, sp_compute, dp_compute,");
    eprintln!("                        int_compute, transfer_bw, kernel_lat, all");
    eprintln!("  -e, --event-timer     Time global_bw with kernel timestamps");
    eprintln!("  -i, --iters <n>       Measured iterations per peak test (default: 50)");
    eprintln!("  -w, --warmup <n>      Warm-up iterations per peak test (default: 10)");
    eprintln!("  --transfer <dir>      Single peer run: write, read, none");
    eprintln!("  --bidirectional       Single bidirectional peer run");
    eprintln!("  --elements <n>        Peer bandwidth buffer elements (default: 10000000)");
    eprintln!("  --format <fmt>        Output: text, json (default: text)");
    eprintln!("  -v, --verbose         Debug logging from the benchmark engine");
    eprintln!("  --help                Show this help");
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config = match Config::parse(&args[1..]) {
        Ok(Some(config)) => config,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(msg) => {
            eprintln!("{}", msg);
            print_usage();
            std::process::exit(1);
        }
    };

    let default_filter = if config.verbose {
        "ze_bench=debug,benchmarks=debug"
    } else {
        "off"
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(default_filter)),
                ),
        )
        .init();

    if let Err(e) = run(&config) {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), Error> {
    info!(backend = ?config.backend, devices = config.devices, "starting");
    match config.backend {
        Backend::Sim => {
            let mut sim = SimConfig::new(config.devices);
            if let Some(units) = config.compute_units {
                sim.capability.compute_units = units;
            }
            run_suites(SimDriver::new(sim), config)
        }
        Backend::Wgpu => {
            let driver = WgpuDriver::new(config.backends, config.devices)?
                .with_compute_units(config.compute_units);
            run_suites(driver, config)
        }
    }
}

fn run_suites<D: Driver>(driver: D, config: &Config) -> Result<(), Error> {
    let mut session = Session::open(driver, &KernelLibrary::builtin())?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if config.runs_peer() {
        peer_bench::run(&mut session, config, &mut out)?;
    }
    if config.runs_peak() {
        peak_bench::run(&mut session, config, &mut out)?;
    }

    session.close()?;
    Ok(())
}
