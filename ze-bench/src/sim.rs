//! A host-simulated device group.
//!
//! Every submission completes synchronously inside `execute_list`. Launches
//! advance a per-group tick counter by a configurable schedule, which makes
//! kernel timestamps (and their wraparound) deterministic. Copy kernels move
//! real bytes between host buffers.

use std::cell::Cell;

use tracing::{debug, trace};

use crate::driver::{
    BufferId, Driver, EventId, EventPoolFlags, EventPoolId, KernelArg, KernelId, ListId, ModuleId,
    QueueId, Slab,
};
use crate::kernels::{ArgKind, KernelLibrary, COPY_KERNEL};
use crate::timing::timestamp_max_value;
use crate::workgroups::suggest_group_size;
use crate::{DeviceCapability, Error, KernelTimestamp, ResultCode};

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub device_count: usize,
    pub capability: DeviceCapability,
    /// Ticks consumed by the n-th launch; the last entry repeats.
    pub launch_ticks: Vec<u64>,
    pub start_tick: u64,
    /// Kernels may bind buffers of other devices in the group.
    pub peer_access: bool,
}

impl SimConfig {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            capability: DeviceCapability {
                name: "Simulated device".into(),
                max_group_size_x: 1024,
                max_group_size_y: 1024,
                max_group_size_z: 64,
                max_group_count_x: 65535,
                max_group_count_y: 65535,
                max_group_count_z: 65535,
                max_invocations_per_group: 1024,
                compute_units: 64,
                max_alloc_size: 1 << 30,
                timer_resolution_ns: 1.0,
                kernel_timestamp_valid_bits: 32,
                kernel_timestamps: true,
                fp16: true,
                fp64: true,
            },
            launch_ticks: vec![1000],
            start_tick: 0,
            peer_access: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub allocations: u64,
    pub frees: u64,
    pub kernels_created: u64,
    pub kernels_destroyed: u64,
    pub executions: u64,
    pub launches: u64,
    pub synchronizations: u64,
    pub list_resets: u64,
    pub host_copies: u64,
}

struct SimBuffer {
    device: usize,
    data: Vec<u8>,
}

struct SimModule {
    device: usize,
    library: KernelLibrary,
}

struct SimKernel {
    device: usize,
    name: String,
    signature: Vec<ArgKind>,
    args: Vec<Option<SimArg>>,
    group_size: Option<[u32; 3]>,
}

#[derive(Clone)]
enum SimArg {
    Buffer(BufferId),
    /// Scalar contents never affect the simulated run.
    Scalar,
}

enum SimCommand {
    Launch {
        kernel: String,
        args: Vec<SimArg>,
        counts: [u32; 3],
        signal: Option<EventId>,
    },
    Signal(EventId),
}

struct SimList {
    device: usize,
    commands: Vec<SimCommand>,
    closed: bool,
}

struct SimPool {
    flags: EventPoolFlags,
    count: u32,
}

struct SimEvent {
    pool: EventPoolId,
    signaled: bool,
    timestamp: Option<KernelTimestamp>,
}

pub struct SimDriver {
    config: SimConfig,
    clock: u64,
    buffers: Slab<SimBuffer>,
    modules: Slab<SimModule>,
    kernels: Slab<SimKernel>,
    queues: Slab<usize>,
    lists: Slab<SimList>,
    pools: Slab<SimPool>,
    events: Slab<SimEvent>,
    stats: SimStats,
    fault: Option<Fault>,
}

/// Injected failure: `op` succeeds `skip` more times, then always fails.
struct Fault {
    op: &'static str,
    code: ResultCode,
    skip: Cell<u64>,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let max = timestamp_max_value(config.capability.kernel_timestamp_valid_bits);
        Self {
            clock: config.start_tick.min(max),
            config,
            buffers: Slab::new(),
            modules: Slab::new(),
            kernels: Slab::new(),
            queues: Slab::new(),
            lists: Slab::new(),
            pools: Slab::new(),
            events: Slab::new(),
            stats: SimStats::default(),
            fault: None,
        }
    }

    /// Makes every later call of `op` fail with `code`.
    pub fn fail_on(&mut self, op: &'static str, code: ResultCode) {
        self.fail_after(op, 0, code);
    }

    /// Lets `successes` calls of `op` through, then fails every later one.
    pub fn fail_after(&mut self, op: &'static str, successes: u64, code: ResultCode) {
        self.fault = Some(Fault {
            op,
            code,
            skip: Cell::new(successes),
        });
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.live()
    }

    pub fn live_kernels(&self) -> usize {
        self.kernels.live()
    }

    pub fn clear_faults(&mut self) {
        self.fault = None;
    }

    pub fn live_modules(&self) -> usize {
        self.modules.live()
    }

    pub fn live_queues(&self) -> usize {
        self.queues.live()
    }

    pub fn live_lists(&self) -> usize {
        self.lists.live()
    }

    pub fn live_events(&self) -> usize {
        self.events.live()
    }

    pub fn live_pools(&self) -> usize {
        self.pools.live()
    }

    /// The whole contents of `buffer`, without counting as a host copy.
    pub fn buffer_contents(&self, buffer: BufferId) -> Result<&[u8], Error> {
        Ok(&self.buffers.get(buffer.0, "buffer_contents")?.data)
    }

    fn check(&self, op: &'static str) -> Result<(), Error> {
        match &self.fault {
            Some(fault) if fault.op == op => match fault.skip.get() {
                0 => Err(Error::driver(op, fault.code)),
                n => {
                    fault.skip.set(n - 1);
                    Ok(())
                }
            },
            _ => Ok(()),
        }
    }

    fn check_device(&self, device: usize, op: &'static str) -> Result<(), Error> {
        self.check(op)?;
        if device >= self.config.device_count {
            return Err(Error::driver(op, ResultCode::InvalidArgument));
        }
        Ok(())
    }

    fn next_launch_ticks(&self) -> u64 {
        let index = (self.stats.launches as usize).min(self.config.launch_ticks.len().saturating_sub(1));
        self.config.launch_ticks.get(index).copied().unwrap_or(1)
    }

    fn advance_clock(&mut self, ticks: u64) -> KernelTimestamp {
        let max = timestamp_max_value(self.config.capability.kernel_timestamp_valid_bits);
        let start = self.clock;
        let span = ticks % max.saturating_add(1).max(1);
        let end = if max - start >= span {
            start + span
        } else {
            span - (max - start) - 1
        };
        self.clock = end;
        KernelTimestamp { start, end }
    }

    fn copy(&mut self, args: &[SimArg]) -> Result<(), Error> {
        let (dst, src) = match args {
            [SimArg::Buffer(dst), SimArg::Buffer(src), ..] => (*dst, *src),
            _ => return Err(Error::driver("execute_list", ResultCode::InvalidArgument)),
        };
        if dst == src {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffers.get_mut(src.0, "execute_list")?.data);
        let result = self.buffers.get_mut(dst.0, "execute_list").map(|target| {
            let n = target.data.len().min(data.len());
            target.data[..n].copy_from_slice(&data[..n]);
        });
        self.buffers.get_mut(src.0, "execute_list")?.data = data;
        result
    }

    fn launch(
        &mut self,
        kernel: &str,
        args: &[SimArg],
        signal: Option<EventId>,
    ) -> Result<(), Error> {
        if kernel == COPY_KERNEL {
            self.copy(args)?;
        }
        let ticks = self.next_launch_ticks();
        let ts = self.advance_clock(ticks);
        self.stats.launches += 1;
        trace!(kernel, start = ts.start, end = ts.end, "sim_launch");

        if let Some(event) = signal {
            let pool = self.events.get(event.0, "execute_list")?.pool;
            let timestamps = self.pools.get(pool.0, "execute_list")?.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP);
            let entry = self.events.get_mut(event.0, "execute_list")?;
            entry.signaled = true;
            if timestamps {
                entry.timestamp = Some(ts);
            }
        }
        Ok(())
    }
}

impl Driver for SimDriver {
    fn device_count(&self) -> usize {
        self.config.device_count
    }

    fn capability(&self, device: usize) -> Result<DeviceCapability, Error> {
        self.check_device(device, "capability")?;
        Ok(self.config.capability.clone())
    }

    fn create_module(&mut self, device: usize, library: &KernelLibrary) -> Result<ModuleId, Error> {
        self.check_device(device, "create_module")?;
        Ok(ModuleId(self.modules.insert(SimModule {
            device,
            library: library.clone(),
        })))
    }

    fn destroy_module(&mut self, module: ModuleId) -> Result<(), Error> {
        self.check("destroy_module")?;
        self.modules.remove(module.0, "destroy_module").map(|_| ())
    }

    fn create_queue(&mut self, device: usize) -> Result<QueueId, Error> {
        self.check_device(device, "create_queue")?;
        Ok(QueueId(self.queues.insert(device)))
    }

    fn destroy_queue(&mut self, queue: QueueId) -> Result<(), Error> {
        self.check("destroy_queue")?;
        self.queues.remove(queue.0, "destroy_queue").map(|_| ())
    }

    fn create_list(&mut self, device: usize) -> Result<ListId, Error> {
        self.check_device(device, "create_list")?;
        Ok(ListId(self.lists.insert(SimList {
            device,
            commands: Vec::new(),
            closed: false,
        })))
    }

    fn destroy_list(&mut self, list: ListId) -> Result<(), Error> {
        self.check("destroy_list")?;
        self.lists.remove(list.0, "destroy_list").map(|_| ())
    }

    fn allocate(&mut self, device: usize, size: usize) -> Result<BufferId, Error> {
        self.check_device(device, "allocate")?;
        if size == 0 {
            return Err(Error::driver("allocate", ResultCode::InvalidSize));
        }
        if size as u64 > self.config.capability.max_alloc_size {
            return Err(Error::driver("allocate", ResultCode::OutOfDeviceMemory));
        }
        self.stats.allocations += 1;
        debug!(device, size, "sim_allocate");
        Ok(BufferId(self.buffers.insert(SimBuffer {
            device,
            data: vec![0; size],
        })))
    }

    fn free(&mut self, buffer: BufferId) -> Result<(), Error> {
        self.check("free")?;
        self.buffers.remove(buffer.0, "free")?;
        self.stats.frees += 1;
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<(), Error> {
        self.check("write_buffer")?;
        let entry = self.buffers.get_mut(buffer.0, "write_buffer")?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= entry.data.len())
            .ok_or(Error::driver("write_buffer", ResultCode::InvalidSize))?;
        entry.data[offset..end].copy_from_slice(data);
        self.stats.host_copies += 1;
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<(), Error> {
        self.check("read_buffer")?;
        let entry = self.buffers.get(buffer.0, "read_buffer")?;
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= entry.data.len())
            .ok_or(Error::driver("read_buffer", ResultCode::InvalidSize))?;
        out.copy_from_slice(&entry.data[offset..end]);
        self.stats.host_copies += 1;
        Ok(())
    }

    fn create_kernel(&mut self, module: ModuleId, name: &str) -> Result<KernelId, Error> {
        self.check("create_kernel")?;
        let module = self.modules.get(module.0, "create_kernel")?;
        let source = module
            .library
            .get(name)
            .ok_or(Error::driver("create_kernel", ResultCode::InvalidArgument))?;
        if let Some(feature) = source.requires {
            if !feature.supported_by(&self.config.capability) {
                return Err(Error::driver("create_kernel", ResultCode::UnsupportedFeature));
            }
        }
        let kernel = SimKernel {
            device: module.device,
            name: name.to_string(),
            signature: source.arguments.clone(),
            args: vec![None; source.arguments.len()],
            group_size: None,
        };
        self.stats.kernels_created += 1;
        Ok(KernelId(self.kernels.insert(kernel)))
    }

    fn destroy_kernel(&mut self, kernel: KernelId) -> Result<(), Error> {
        self.check("destroy_kernel")?;
        self.kernels.remove(kernel.0, "destroy_kernel")?;
        self.stats.kernels_destroyed += 1;
        Ok(())
    }

    fn set_kernel_argument(
        &mut self,
        kernel: KernelId,
        index: u32,
        arg: KernelArg<'_>,
    ) -> Result<(), Error> {
        const OP: &str = "set_kernel_argument";
        self.check(OP)?;
        let entry = self.kernels.get(kernel.0, OP)?;
        let kind = entry
            .signature
            .get(index as usize)
            .copied()
            .ok_or(Error::driver(OP, ResultCode::InvalidArgument))?;
        let value = match (kind, arg) {
            (ArgKind::Buffer, KernelArg::Buffer(buffer)) => {
                let buffer_device = self.buffers.get(buffer.0, OP)?.device;
                if buffer_device != entry.device && !self.config.peer_access {
                    return Err(Error::driver(OP, ResultCode::UnsupportedFeature));
                }
                SimArg::Buffer(buffer)
            }
            (ArgKind::Scalar(size), KernelArg::Bytes(bytes)) => {
                if bytes.len() != size {
                    return Err(Error::driver(OP, ResultCode::InvalidSize));
                }
                SimArg::Scalar
            }
            _ => return Err(Error::driver(OP, ResultCode::InvalidArgument)),
        };
        if let Some(slot) = self.kernels.get_mut(kernel.0, OP)?.args.get_mut(index as usize) {
            *slot = Some(value);
        }
        Ok(())
    }

    fn suggest_group_size(&mut self, kernel: KernelId, global: [u32; 3]) -> Result<[u32; 3], Error> {
        self.check("suggest_group_size")?;
        self.kernels.get(kernel.0, "suggest_group_size")?;
        let cap = &self.config.capability;
        Ok(suggest_group_size(global, cap.max_group_size(), cap.max_invocations_per_group))
    }

    fn set_group_size(&mut self, kernel: KernelId, size: [u32; 3]) -> Result<(), Error> {
        self.check("set_group_size")?;
        let cap = &self.config.capability;
        let legal = size
            .iter()
            .zip(cap.max_group_size())
            .all(|(&s, max)| s >= 1 && s <= max)
            && size.iter().map(|&s| s as u64).product::<u64>() <= cap.max_invocations_per_group as u64;
        if !legal {
            return Err(Error::driver("set_group_size", ResultCode::InvalidArgument));
        }
        self.kernels.get_mut(kernel.0, "set_group_size")?.group_size = Some(size);
        Ok(())
    }

    fn append_launch(
        &mut self,
        list: ListId,
        kernel: KernelId,
        counts: [u32; 3],
        signal: Option<EventId>,
    ) -> Result<(), Error> {
        const OP: &str = "append_launch";
        self.check(OP)?;
        let entry = self.kernels.get(kernel.0, OP)?;
        let cap = &self.config.capability;
        let counts_legal = counts
            .iter()
            .zip(cap.max_group_count())
            .all(|(&c, max)| c >= 1 && c <= max);
        if entry.group_size.is_none() || !counts_legal {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        let args = entry
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or(Error::driver(OP, ResultCode::InvalidArgument))?;
        let name = entry.name.clone();
        let kernel_device = entry.device;
        if let Some(event) = signal {
            self.events.get(event.0, OP)?;
        }

        let target = self.lists.get_mut(list.0, OP)?;
        if target.closed || target.device != kernel_device {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        target.commands.push(SimCommand::Launch {
            kernel: name,
            args,
            counts,
            signal,
        });
        Ok(())
    }

    fn append_signal_event(&mut self, list: ListId, event: EventId) -> Result<(), Error> {
        self.check("append_signal_event")?;
        self.events.get(event.0, "append_signal_event")?;
        let target = self.lists.get_mut(list.0, "append_signal_event")?;
        if target.closed {
            return Err(Error::driver("append_signal_event", ResultCode::InvalidArgument));
        }
        target.commands.push(SimCommand::Signal(event));
        Ok(())
    }

    fn close_list(&mut self, list: ListId) -> Result<(), Error> {
        self.check("close_list")?;
        self.lists.get_mut(list.0, "close_list")?.closed = true;
        Ok(())
    }

    fn execute_list(&mut self, queue: QueueId, list: ListId) -> Result<(), Error> {
        const OP: &str = "execute_list";
        self.check(OP)?;
        let queue_device = *self.queues.get(queue.0, OP)?;
        // Taken out for the duration of the run so launches can borrow the driver.
        let commands = {
            let target = self.lists.get_mut(list.0, OP)?;
            if !target.closed || target.device != queue_device {
                return Err(Error::driver(OP, ResultCode::InvalidArgument));
            }
            std::mem::take(&mut target.commands)
        };

        let mut result = Ok(());
        for command in &commands {
            result = match command {
                SimCommand::Launch {
                    kernel,
                    args,
                    counts,
                    signal,
                } => {
                    trace!(kernel = %kernel, ?counts, "sim_execute_launch");
                    self.launch(kernel, args, *signal)
                }
                SimCommand::Signal(event) => self
                    .events
                    .get_mut(event.0, OP)
                    .map(|entry| entry.signaled = true),
            };
            if result.is_err() {
                break;
            }
        }

        self.lists.get_mut(list.0, OP)?.commands = commands;
        self.stats.executions += 1;
        result
    }

    fn synchronize_queue(&mut self, queue: QueueId, _timeout: u64) -> Result<(), Error> {
        self.check("synchronize_queue")?;
        self.queues.get(queue.0, "synchronize_queue")?;
        self.stats.synchronizations += 1;
        Ok(())
    }

    fn reset_list(&mut self, list: ListId) -> Result<(), Error> {
        self.check("reset_list")?;
        let target = self.lists.get_mut(list.0, "reset_list")?;
        target.commands.clear();
        target.closed = false;
        self.stats.list_resets += 1;
        Ok(())
    }

    fn create_event_pool(
        &mut self,
        device: usize,
        flags: EventPoolFlags,
        count: u32,
    ) -> Result<EventPoolId, Error> {
        self.check_device(device, "create_event_pool")?;
        if flags.contains(EventPoolFlags::KERNEL_TIMESTAMP) && !self.config.capability.kernel_timestamps {
            return Err(Error::driver("create_event_pool", ResultCode::UnsupportedFeature));
        }
        if count == 0 {
            return Err(Error::driver("create_event_pool", ResultCode::InvalidSize));
        }
        Ok(EventPoolId(self.pools.insert(SimPool { flags, count })))
    }

    fn create_event(&mut self, pool: EventPoolId, index: u32) -> Result<EventId, Error> {
        self.check("create_event")?;
        if index >= self.pools.get(pool.0, "create_event")?.count {
            return Err(Error::driver("create_event", ResultCode::InvalidArgument));
        }
        Ok(EventId(self.events.insert(SimEvent {
            pool,
            signaled: false,
            timestamp: None,
        })))
    }

    fn host_wait(&mut self, event: EventId, _timeout: u64) -> Result<(), Error> {
        self.check("host_wait")?;
        if self.events.get(event.0, "host_wait")?.signaled {
            Ok(())
        } else {
            // Nothing pending could ever signal it.
            Err(Error::driver("host_wait", ResultCode::NotReady))
        }
    }

    fn host_reset(&mut self, event: EventId) -> Result<(), Error> {
        self.check("host_reset")?;
        let entry = self.events.get_mut(event.0, "host_reset")?;
        entry.signaled = false;
        entry.timestamp = None;
        Ok(())
    }

    fn query_timestamp(&mut self, event: EventId) -> Result<KernelTimestamp, Error> {
        self.check("query_timestamp")?;
        let entry = self.events.get(event.0, "query_timestamp")?;
        let pool = self.pools.get(entry.pool.0, "query_timestamp")?;
        if !pool.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP) {
            return Err(Error::driver("query_timestamp", ResultCode::UnsupportedFeature));
        }
        entry
            .timestamp
            .ok_or(Error::driver("query_timestamp", ResultCode::NotReady))
    }

    fn destroy_event(&mut self, event: EventId) -> Result<(), Error> {
        self.check("destroy_event")?;
        self.events.remove(event.0, "destroy_event").map(|_| ())
    }

    fn destroy_event_pool(&mut self, pool: EventPoolId) -> Result<(), Error> {
        self.check("destroy_event_pool")?;
        self.pools.remove(pool.0, "destroy_event_pool").map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_with(config: SimConfig) -> (SimDriver, ModuleId, QueueId, ListId) {
        let mut driver = SimDriver::new(config);
        let module = driver.create_module(0, &KernelLibrary::builtin()).unwrap();
        let queue = driver.create_queue(0).unwrap();
        let list = driver.create_list(0).unwrap();
        (driver, module, queue, list)
    }

    #[test]
    fn copy_kernel_moves_bytes() {
        let (mut driver, module, queue, list) = driver_with(SimConfig::new(1));
        let src = driver.allocate(0, 16).unwrap();
        let dst = driver.allocate(0, 16).unwrap();
        driver.write_buffer(src, 0, &[7; 16]).unwrap();

        let kernel = driver.create_kernel(module, COPY_KERNEL).unwrap();
        driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(dst)).unwrap();
        driver.set_kernel_argument(kernel, 1, KernelArg::Buffer(src)).unwrap();
        driver.set_group_size(kernel, [1, 1, 1]).unwrap();
        driver.append_launch(list, kernel, [2, 1, 1], None).unwrap();
        driver.close_list(list).unwrap();
        driver.execute_list(queue, list).unwrap();

        assert_eq!(driver.buffer_contents(dst).unwrap(), &[7; 16]);
        assert_eq!(driver.stats().launches, 1);
    }

    #[test]
    fn timestamps_wrap_at_valid_bits() {
        let mut config = SimConfig::new(1);
        config.capability.kernel_timestamp_valid_bits = 4;
        config.start_tick = 10;
        config.launch_ticks = vec![11];
        let (mut driver, module, queue, list) = driver_with(config);

        let buffer = driver.allocate(0, 4).unwrap();
        let kernel = driver.create_kernel(module, crate::kernels::KERNEL_LATENCY).unwrap();
        driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(buffer)).unwrap();
        driver.set_group_size(kernel, [1, 1, 1]).unwrap();
        let pool = driver
            .create_event_pool(0, EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP, 1)
            .unwrap();
        let event = driver.create_event(pool, 0).unwrap();
        driver.append_launch(list, kernel, [1, 1, 1], Some(event)).unwrap();
        driver.close_list(list).unwrap();
        driver.execute_list(queue, list).unwrap();

        driver.host_wait(event, u64::MAX).unwrap();
        assert_eq!(driver.query_timestamp(event).unwrap(), KernelTimestamp { start: 10, end: 5 });
        driver.host_reset(event).unwrap();
        assert!(driver.host_wait(event, u64::MAX).is_err());
    }

    #[test]
    fn unbound_arguments_reject_the_launch() {
        let (mut driver, module, _queue, list) = driver_with(SimConfig::new(1));
        let kernel = driver.create_kernel(module, COPY_KERNEL).unwrap();
        driver.set_group_size(kernel, [1, 1, 1]).unwrap();
        let err = driver.append_launch(list, kernel, [1, 1, 1], None).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver { op: "append_launch", code: ResultCode::InvalidArgument }
        ));
    }

    #[test]
    fn executing_an_open_list_fails() {
        let (mut driver, _module, queue, list) = driver_with(SimConfig::new(1));
        assert!(driver.execute_list(queue, list).is_err());
        driver.close_list(list).unwrap();
        driver.execute_list(queue, list).unwrap();
        driver.reset_list(list).unwrap();
        assert!(driver.execute_list(queue, list).is_err());
    }

    #[test]
    fn allocation_limits_are_enforced() {
        let mut config = SimConfig::new(2);
        config.capability.max_alloc_size = 64;
        let mut driver = SimDriver::new(config);
        assert!(driver.allocate(0, 0).is_err());
        assert!(driver.allocate(1, 65).is_err());
        assert!(driver.allocate(2, 8).is_err());
        let buffer = driver.allocate(1, 64).unwrap();
        driver.free(buffer).unwrap();
        assert!(driver.free(buffer).is_err());
        assert_eq!(driver.stats().allocations, 1);
        assert_eq!(driver.stats().frees, 1);
    }

    #[test]
    fn injected_failure_hits_only_the_named_call() {
        let mut driver = SimDriver::new(SimConfig::new(1));
        driver.fail_on("create_queue", ResultCode::OutOfHostMemory);
        assert!(driver.create_list(0).is_ok());
        assert!(matches!(
            driver.create_queue(0),
            Err(Error::Driver { op: "create_queue", code: ResultCode::OutOfHostMemory })
        ));
    }

    #[test]
    fn host_copies_round_trip() {
        let mut driver = SimDriver::new(SimConfig::new(1));
        let buffer = driver.allocate(0, 8).unwrap();
        driver.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 6];
        driver.read_buffer(buffer, 2, &mut back).unwrap();
        assert_eq!(back, [0, 0, 1, 2, 3, 4]);
        assert!(driver.write_buffer(buffer, 6, &[0; 4]).is_err());
        assert!(driver.read_buffer(buffer, usize::MAX, &mut back).is_err());
        assert_eq!(driver.stats().host_copies, 2);
    }

    #[test]
    fn scalar_arguments_must_match_the_signature() {
        let (mut driver, module, _queue, _list) = driver_with(SimConfig::new(1));
        let sp = driver.create_kernel(module, &crate::kernels::compute_sp_name(1)).unwrap();
        let dp = driver.create_kernel(module, &crate::kernels::compute_dp_name(1)).unwrap();

        driver.set_kernel_argument(sp, 1, KernelArg::Bytes(&1.3f32.to_le_bytes())).unwrap();
        assert!(matches!(
            driver.set_kernel_argument(dp, 1, KernelArg::Bytes(&1.3f32.to_le_bytes())),
            Err(Error::Driver { code: ResultCode::InvalidSize, .. })
        ));
        driver.set_kernel_argument(dp, 1, KernelArg::Bytes(&1.3f64.to_le_bytes())).unwrap();
        assert!(matches!(
            driver.set_kernel_argument(sp, 0, KernelArg::Bytes(&[0; 4])),
            Err(Error::Driver { code: ResultCode::InvalidArgument, .. })
        ));
        assert!(driver.set_kernel_argument(sp, 2, KernelArg::Bytes(&[0; 4])).is_err());
    }

    #[test]
    fn peer_buffers_need_peer_access() {
        let mut config = SimConfig::new(2);
        config.peer_access = false;
        let (mut driver, module, _queue, _list) = driver_with(config);
        let local = driver.allocate(0, 16).unwrap();
        let remote = driver.allocate(1, 16).unwrap();
        let kernel = driver.create_kernel(module, COPY_KERNEL).unwrap();
        driver.set_kernel_argument(kernel, 0, KernelArg::Buffer(local)).unwrap();
        assert!(matches!(
            driver.set_kernel_argument(kernel, 1, KernelArg::Buffer(remote)),
            Err(Error::Driver { code: ResultCode::UnsupportedFeature, .. })
        ));
    }

    #[test]
    fn gated_kernels_need_device_support() {
        let mut config = SimConfig::new(1);
        config.capability.fp64 = false;
        let (mut driver, module, _queue, _list) = driver_with(config);
        assert!(driver.create_kernel(module, &crate::kernels::compute_hp_name(4)).is_ok());
        assert!(matches!(
            driver.create_kernel(module, &crate::kernels::compute_dp_name(4)),
            Err(Error::Driver { op: "create_kernel", code: ResultCode::UnsupportedFeature })
        ));
    }

    #[test]
    fn delayed_failure_counts_successes() {
        let mut driver = SimDriver::new(SimConfig::new(1));
        driver.fail_after("create_queue", 2, ResultCode::OutOfHostMemory);
        assert!(driver.create_queue(0).is_ok());
        assert!(driver.create_queue(0).is_ok());
        assert!(driver.create_queue(0).is_err());
        assert!(driver.create_queue(0).is_err());
        assert_eq!(driver.live_queues(), 2);
    }
}
