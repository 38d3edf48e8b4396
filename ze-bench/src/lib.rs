use std::fmt;

pub use ze_types::{
    DeviceCapability, KernelTimestamp, PeakMeasurement, PeerMeasurement, PeerMetric,
    PeerTransfer, TimingMode, WorkgroupPlan,
};

pub mod driver;
pub mod kernels;
pub mod peak;
pub mod peer;
pub mod report;
pub mod session;
pub mod sim;
pub mod timer;
pub mod timing;
mod validation;
pub mod wgpu_driver;
pub mod workgroups;

pub use crate::driver::Driver;
pub use crate::kernels::KernelLibrary;
pub use crate::peak::PeakBenchmark;
pub use crate::peer::PeerBenchmark;
pub use crate::session::{DeviceContext, Session};
pub use crate::sim::SimDriver;
pub use crate::timing::TimingEngine;
pub use crate::wgpu_driver::WgpuDriver;

/// Status reported by a failed driver call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultCode {
    NotReady,
    DeviceLost,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InvalidArgument,
    InvalidNullHandle,
    UnsupportedFeature,
    InvalidSize,
    Unknown,
}

impl ResultCode {
    pub fn code(self) -> u32 {
        match self {
            ResultCode::NotReady => 0x1,
            ResultCode::DeviceLost => 0x7000_0001,
            ResultCode::OutOfHostMemory => 0x7000_0002,
            ResultCode::OutOfDeviceMemory => 0x7000_0003,
            ResultCode::InvalidArgument => 0x7800_0004,
            ResultCode::InvalidNullHandle => 0x7800_0005,
            ResultCode::UnsupportedFeature => 0x7800_0003,
            ResultCode::InvalidSize => 0x7800_0008,
            ResultCode::Unknown => 0x7fff_fffe,
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Driver { op: &'static str, code: ResultCode },
    InvalidArgument(String),
    InvalidConfig(String),
    GpuInit(String),
    Io(std::io::Error),
}

impl Error {
    pub(crate) fn driver(op: &'static str, code: ResultCode) -> Self {
        Error::Driver { op, code }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Driver { op, code } => {
                write!(f, "{} failed: {:?} ({:#x})", op, code, code.code())
            }
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::GpuInit(msg) => write!(f, "GPU initialization failed: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
