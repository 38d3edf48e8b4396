use serde::{Deserialize, Serialize};

/// Limits and timer properties of one device, fetched once per session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceCapability {
    pub name: String,
    pub max_group_size_x: u32,
    pub max_group_size_y: u32,
    pub max_group_size_z: u32,
    pub max_group_count_x: u32,
    pub max_group_count_y: u32,
    pub max_group_count_z: u32,
    pub max_invocations_per_group: u32,
    pub compute_units: u32,
    pub max_alloc_size: u64,
    /// Nanoseconds per kernel timestamp tick.
    pub timer_resolution_ns: f64,
    pub kernel_timestamp_valid_bits: u32,
    pub kernel_timestamps: bool,
    /// Half-precision arithmetic in kernels.
    pub fp16: bool,
    /// Double-precision arithmetic in kernels.
    pub fp64: bool,
}

impl DeviceCapability {
    pub fn max_group_size(&self) -> [u32; 3] {
        [self.max_group_size_x, self.max_group_size_y, self.max_group_size_z]
    }

    pub fn max_group_count(&self) -> [u32; 3] {
        [self.max_group_count_x, self.max_group_count_y, self.max_group_count_z]
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkgroupPlan {
    pub group_size_x: u32,
    pub group_size_y: u32,
    pub group_size_z: u32,
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

impl WorkgroupPlan {
    pub fn group_size(&self) -> [u32; 3] {
        [self.group_size_x, self.group_size_y, self.group_size_z]
    }

    pub fn group_count(&self) -> [u32; 3] {
        [self.group_count_x, self.group_count_y, self.group_count_z]
    }

    pub fn total_work_items(&self) -> u64 {
        self.group_size_x as u64
            * self.group_count_x as u64
            * self.group_size_y as u64
            * self.group_count_y as u64
            * self.group_size_z as u64
            * self.group_count_z as u64
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    Bandwidth,
    BandwidthEventTiming,
    KernelLaunchLatency,
    KernelCompleteRuntime,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerTransfer {
    Write,
    Read,
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMetric {
    Bandwidth,
    Latency,
}

impl PeerMetric {
    pub fn unit(self) -> &'static str {
        match self {
            PeerMetric::Bandwidth => "GBPS",
            PeerMetric::Latency => "uS",
        }
    }
}

/// Device-reported start/end ticks of one kernel execution.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelTimestamp {
    pub start: u64,
    pub end: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeerMeasurement {
    pub src_device: usize,
    pub dst_device: usize,
    pub bidirectional: bool,
    pub transfer: PeerTransfer,
    pub metric: PeerMetric,
    pub value: f64,
}

impl PeerMeasurement {
    pub fn arrow(&self) -> &'static str {
        if self.bidirectional {
            "<->"
        } else if self.transfer == PeerTransfer::Read {
            "<-"
        } else {
            "->"
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeakMeasurement {
    pub test: String,
    pub variant: String,
    pub value: f64,
    pub unit: String,
}
