//! The boundary between the measurement engine and a compute driver.
//!
//! Handles are plain indices into per-driver tables. A device is addressed by
//! its position in the device group.

use std::ops::BitOr;

use crate::kernels::KernelLibrary;
use crate::{DeviceCapability, Error, KernelTimestamp, ResultCode};

macro_rules! handle {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

handle!(BufferId);
handle!(ModuleId);
handle!(KernelId);
handle!(QueueId);
handle!(ListId);
handle!(EventPoolId);
handle!(EventId);

/// Wait forever.
pub const NO_TIMEOUT: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EventPoolFlags(u32);

impl EventPoolFlags {
    pub const HOST_VISIBLE: EventPoolFlags = EventPoolFlags(1);
    pub const KERNEL_TIMESTAMP: EventPoolFlags = EventPoolFlags(1 << 1);

    pub fn contains(self, other: EventPoolFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventPoolFlags {
    type Output = EventPoolFlags;

    fn bitor(self, rhs: EventPoolFlags) -> EventPoolFlags {
        EventPoolFlags(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum KernelArg<'a> {
    Buffer(BufferId),
    Bytes(&'a [u8]),
}

pub trait Driver {
    fn device_count(&self) -> usize;
    fn capability(&self, device: usize) -> Result<DeviceCapability, Error>;

    fn create_module(&mut self, device: usize, library: &KernelLibrary) -> Result<ModuleId, Error>;
    fn destroy_module(&mut self, module: ModuleId) -> Result<(), Error>;
    fn create_queue(&mut self, device: usize) -> Result<QueueId, Error>;
    fn destroy_queue(&mut self, queue: QueueId) -> Result<(), Error>;
    fn create_list(&mut self, device: usize) -> Result<ListId, Error>;
    fn destroy_list(&mut self, list: ListId) -> Result<(), Error>;

    fn allocate(&mut self, device: usize, size: usize) -> Result<BufferId, Error>;
    fn free(&mut self, buffer: BufferId) -> Result<(), Error>;
    /// Copies host memory into `buffer` at `offset`; returns once the copy
    /// has landed.
    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<(), Error>;
    /// Copies `out.len()` bytes of `buffer` from `offset` back to the host.
    fn read_buffer(&mut self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<(), Error>;

    fn create_kernel(&mut self, module: ModuleId, name: &str) -> Result<KernelId, Error>;
    fn destroy_kernel(&mut self, kernel: KernelId) -> Result<(), Error>;
    fn set_kernel_argument(&mut self, kernel: KernelId, index: u32, arg: KernelArg<'_>)
        -> Result<(), Error>;
    fn suggest_group_size(&mut self, kernel: KernelId, global: [u32; 3]) -> Result<[u32; 3], Error>;
    fn set_group_size(&mut self, kernel: KernelId, size: [u32; 3]) -> Result<(), Error>;

    /// Appends a launch of `kernel` with `counts` groups; `signal` is
    /// signaled (and timestamped, for timestamp pools) when the kernel ends.
    fn append_launch(
        &mut self,
        list: ListId,
        kernel: KernelId,
        counts: [u32; 3],
        signal: Option<EventId>,
    ) -> Result<(), Error>;
    fn append_signal_event(&mut self, list: ListId, event: EventId) -> Result<(), Error>;
    fn close_list(&mut self, list: ListId) -> Result<(), Error>;
    fn execute_list(&mut self, queue: QueueId, list: ListId) -> Result<(), Error>;
    fn synchronize_queue(&mut self, queue: QueueId, timeout: u64) -> Result<(), Error>;
    fn reset_list(&mut self, list: ListId) -> Result<(), Error>;

    fn create_event_pool(
        &mut self,
        device: usize,
        flags: EventPoolFlags,
        count: u32,
    ) -> Result<EventPoolId, Error>;
    fn create_event(&mut self, pool: EventPoolId, index: u32) -> Result<EventId, Error>;
    fn host_wait(&mut self, event: EventId, timeout: u64) -> Result<(), Error>;
    fn host_reset(&mut self, event: EventId) -> Result<(), Error>;
    fn query_timestamp(&mut self, event: EventId) -> Result<KernelTimestamp, Error>;
    fn destroy_event(&mut self, event: EventId) -> Result<(), Error>;
    fn destroy_event_pool(&mut self, pool: EventPoolId) -> Result<(), Error>;
}

/// Index-addressed storage for driver objects; freed slots are never reused
/// so a stale handle always fails.
pub(crate) struct Slab<T> {
    entries: Vec<Option<T>>,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, value: T) -> u32 {
        self.entries.push(Some(value));
        (self.entries.len() - 1) as u32
    }

    pub fn get(&self, id: u32, op: &'static str) -> Result<&T, Error> {
        self.entries
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::driver(op, ResultCode::InvalidNullHandle))
    }

    pub fn get_mut(&mut self, id: u32, op: &'static str) -> Result<&mut T, Error> {
        self.entries
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::driver(op, ResultCode::InvalidNullHandle))
    }

    pub fn remove(&mut self, id: u32, op: &'static str) -> Result<T, Error> {
        self.entries
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(Error::driver(op, ResultCode::InvalidNullHandle))
    }

    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}
