use wgpu::Backends;
use ze_bench::peak::ALL_TESTS;
use ze_bench::timing::{DEFAULT_ITERS, DEFAULT_WARMUP_ITERATIONS};
use ze_types::PeerTransfer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bench {
    Peer,
    Peak,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Wgpu,
    Sim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub bench: Bench,
    pub backend: Backend,
    pub backends: Backends,
    /// Devices in the group: simulated devices, or adapters opened.
    pub devices: usize,
    /// Device the peak tests run on.
    pub device: usize,
    pub compute_units: Option<u32>,
    pub verbose: bool,
    pub event_timer: bool,
    pub tests: Vec<String>,
    pub transfer: Option<PeerTransfer>,
    pub bidirectional: bool,
    pub elements: Option<usize>,
    pub iters: u32,
    pub warmup: u32,
    pub format: Format,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bench: Bench::All,
            backend: Backend::Wgpu,
            backends: Backends::PRIMARY,
            devices: 1,
            device: 0,
            compute_units: None,
            verbose: false,
            event_timer: false,
            tests: ALL_TESTS.iter().map(|t| t.to_string()).collect(),
            transfer: None,
            bidirectional: false,
            elements: None,
            iters: DEFAULT_ITERS,
            warmup: DEFAULT_WARMUP_ITERATIONS,
            format: Format::Text,
        }
    }
}

impl Config {
    /// Parses the arguments after the program name; `Ok(None)` means help
    /// was requested.
    pub fn parse(args: &[String]) -> Result<Option<Config>, String> {
        let mut config = Config::default();
        let mut devices = None;
        let mut tests: Vec<String> = Vec::new();

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let mut value = || -> Result<&str, String> {
                i += 1;
                args.get(i)
                    .map(String::as_str)
                    .ok_or_else(|| format!("Missing value for {}", flag))
            };
            match flag {
                "--bench" => {
                    config.bench = match value()? {
                        "peer" => Bench::Peer,
                        "peak" => Bench::Peak,
                        "all" => Bench::All,
                        other => return Err(format!("Unknown benchmark: {}", other)),
                    }
                }
                "--backend" => {
                    config.backend = match value()? {
                        "wgpu" => Backend::Wgpu,
                        "sim" => Backend::Sim,
                        other => return Err(format!("Unknown backend: {}", other)),
                    }
                }
                "-p" | "--platform" => config.backends = parse_backends(value()?)?,
                "--devices" => devices = Some(parse_number(flag, value()?)?),
                "-d" | "--device" => config.device = parse_number(flag, value()?)?,
                "--compute-units" => config.compute_units = Some(parse_number(flag, value()?)?),
                "-v" | "--verbose" => config.verbose = true,
                "-e" | "--event-timer" => config.event_timer = true,
                "-t" => {
                    for test in value()?.split(',') {
                        if test == "all" {
                            tests.extend(ALL_TESTS.iter().map(|t| t.to_string()));
                        } else if ALL_TESTS.contains(&test) {
                            tests.push(test.to_string());
                        } else {
                            return Err(format!("Unknown test: {}", test));
                        }
                    }
                }
                "--transfer" => {
                    config.transfer = Some(match value()? {
                        "write" => PeerTransfer::Write,
                        "read" => PeerTransfer::Read,
                        "none" => PeerTransfer::None,
                        other => return Err(format!("Unknown transfer: {}", other)),
                    })
                }
                "--bidirectional" => config.bidirectional = true,
                "--elements" => config.elements = Some(parse_number(flag, value()?)?),
                "-i" | "--iters" => config.iters = parse_number(flag, value()?)?,
                "-w" | "--warmup" => config.warmup = parse_number(flag, value()?)?,
                "--format" => {
                    config.format = match value()? {
                        "text" => Format::Text,
                        "json" => Format::Json,
                        other => return Err(format!("Unknown format: {}", other)),
                    }
                }
                "--help" | "-h" => return Ok(None),
                other => return Err(format!("Unknown flag: {}", other)),
            }
            i += 1;
        }

        if !tests.is_empty() {
            config.tests = tests;
        }
        config.devices = devices.unwrap_or(match config.backend {
            Backend::Wgpu => 1,
            Backend::Sim => 2,
        });
        if config.iters == 0 {
            return Err("--iters must be at least 1".to_string());
        }
        Ok(Some(config))
    }

    pub fn runs_peer(&self) -> bool {
        matches!(self.bench, Bench::Peer | Bench::All)
    }

    pub fn runs_peak(&self) -> bool {
        matches!(self.bench, Bench::Peak | Bench::All)
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, value))
}

fn parse_backends(name: &str) -> Result<Backends, String> {
    Ok(match name {
        "primary" => Backends::PRIMARY,
        "all" => Backends::all(),
        "vulkan" => Backends::VULKAN,
        "metal" => Backends::METAL,
        "dx12" => Backends::DX12,
        "gl" => Backends::GL,
        other => return Err(format!("Unknown platform: {}", other)),
    })
}
