use std::process::{Command, Output};

fn run_benchmarks(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_benchmarks"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to launch benchmarks")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_integration_sim_peer_suite() {
    let output = run_benchmarks(&["--backend", "sim", "--bench", "peer", "--elements", "64"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let text = stdout(&output);
    let headers = [
        "Unidirectional Bandwidth P2P Write",
        "Unidirectional Bandwidth P2P Read",
        "Bidirectional Bandwidth P2P",
        "Unidirectional Latency P2P Write",
        "Unidirectional Latency P2P Read",
        "Bidirectional Latency P2P",
    ];
    let mut last = 0;
    for header in headers {
        let at = text[last..]
            .find(header)
            .unwrap_or_else(|| panic!("missing {:?} in\n{}", header, text));
        last += at + header.len();
    }
    assert_eq!(text.matches(" Device(0)->Device(1):  GBPS ").count(), 1);
    assert_eq!(text.matches(" Device(1)<-Device(0): ").count(), 2);
    assert!(text.contains(" uS"));
}

#[test]
fn test_integration_invalid_transfer_is_fatal() {
    let output = run_benchmarks(&["--backend", "sim", "--bench", "peer", "--transfer", "none"]);
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("ERROR: "), "{}", err);
    assert!(err.contains("transfer type parameter is invalid"), "{}", err);
}

#[test]
fn test_integration_peak_json() {
    let output = run_benchmarks(&[
        "--backend", "sim", "--bench", "peak", "-t", "global_bw", "--iters", "2", "--warmup", "1",
        "--format", "json",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let text = stdout(&output);
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r["test"] == "global_bw" && r["unit"] == "GBPS"));
    assert_eq!(records[2]["variant"], "float4");
}

#[test]
fn test_integration_transfer_bw_json() {
    let output = run_benchmarks(&[
        "--backend", "sim", "--bench", "peak", "-t", "transfer_bw", "--iters", "2", "--warmup", "1",
        "--format", "json",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let records: Vec<serde_json::Value> = stdout(&output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["variant"], "host_to_device");
    assert_eq!(records[1]["variant"], "device_to_host");
    assert!(records.iter().all(|r| r["unit"] == "GBPS"));
}

#[test]
fn test_integration_invalid_device_falls_back() {
    let output = run_benchmarks(&[
        "--backend", "sim", "--bench", "peak", "-t", "kernel_lat", "-d", "7", "--iters", "1",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("Specified device 7 is not valid, will default to the first device"));
    assert!(text.contains("Kernel latency (uS)"));
    assert!(text.contains("<<<<<<<<<<<<<<<<<<<<<<<<<<<<"));
}

#[test]
fn test_integration_usage() {
    let output = run_benchmarks(&["--help"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("Usage: benchmarks"));

    let output = run_benchmarks(&["--bogus"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Unknown flag: --bogus"));
}
