//! Text rendering of measurements.

use crate::{PeakMeasurement, PeerMeasurement, PeerMetric, PeerTransfer};

/// Significant digits of every reported value.
pub const PRECISION: usize = 11;

/// Formats `value` like C's `%.*g`: `precision` significant digits, trailing
/// zeros dropped, scientific notation outside `1e-4 ..< 10^precision`.
pub fn format_significant(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let precision = precision.max(1);
    // Rounded to the final digit count first so 9.99..→10 moves the exponent.
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };

    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

pub fn peer_header(metric: PeerMetric, bidirectional: bool, transfer: PeerTransfer) -> String {
    let direction = if bidirectional {
        "Bidirectional"
    } else {
        "Unidirectional"
    };
    let metric = match metric {
        PeerMetric::Bandwidth => "Bandwidth",
        PeerMetric::Latency => "Latency",
    };
    let transfer = match transfer {
        PeerTransfer::Read => "Read",
        _ => "Write",
    };
    format!("{} {} P2P {}", direction, metric, transfer)
}

pub fn peer_line(m: &PeerMeasurement) -> String {
    let value = format_significant(m.value, PRECISION);
    match m.metric {
        PeerMetric::Bandwidth => format!(
            " Device({}){}Device({}):  GBPS {}",
            m.src_device,
            m.arrow(),
            m.dst_device,
            value
        ),
        PeerMetric::Latency => format!(
            " Device({}){}Device({}): {} uS",
            m.src_device,
            m.arrow(),
            m.dst_device,
            value
        ),
    }
}

pub fn peak_header(test: &str) -> String {
    match test {
        "global_bw" => "Global memory bandwidth (GBPS)".to_string(),
        "hp_compute" => "Half-precision compute (GFLOPS)".to_string(),
        "sp_compute" => "Single-precision compute (GFLOPS)".to_string(),
        "dp_compute" => "Double-precision compute (GFLOPS)".to_string(),
        "int_compute" => "Integer compute (GIOPS)".to_string(),
        "transfer_bw" => "Transfer bandwidth (GBPS)".to_string(),
        "kernel_lat" => "Kernel latency (uS)".to_string(),
        other => other.to_string(),
    }
}

pub fn peak_line(m: &PeakMeasurement) -> String {
    format!("{:>24} : {:.2} {}", m.variant, m.value, m.unit)
}

/// Closes every peak test.
pub const PEAK_TEST_COMPLETE: &str = "<<<<<<<<<<<<<<<<<<<<<<<<<<<<";
