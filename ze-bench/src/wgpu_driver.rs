//! `Driver` on top of wgpu: one wgpu device per adapter.
//!
//! Pipelines are compiled the first time a kernel is launched with a group
//! size, since WGSL fixes the workgroup size at compile time. A command list
//! records passes with their bind groups; executing it encodes and submits
//! them, cutting a submission at every signaled event so the event can be
//! tied to `Queue::on_submitted_work_done`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use pollster::block_on;
use tracing::{debug, error, info, info_span, warn};
use wgpu::{
    Backends, BindGroupDescriptor, BindGroupEntry, BufferDescriptor, BufferUsages,
    CommandEncoder, CommandEncoderDescriptor, ComputePassDescriptor, ComputePassTimestampWrites,
    ComputePipelineDescriptor, DeviceDescriptor, DeviceType, ErrorFilter, Features,
    InstanceDescriptor, Limits, Maintain, MapMode, PipelineCompilationOptions,
    QuerySetDescriptor, QueryType, ShaderModuleDescriptor, ShaderSource,
};

use crate::driver::{
    BufferId, Driver, EventId, EventPoolFlags, EventPoolId, KernelArg, KernelId, ListId, ModuleId,
    QueueId, Slab,
};
use crate::kernels::{with_group_size, ArgKind, KernelLibrary};
use crate::workgroups::suggest_group_size;
use crate::{DeviceCapability, Error, KernelTimestamp, ResultCode};

/// Resolved timestamps of one event live at this stride in the readback buffer.
const TIMESTAMP_STRIDE: u64 = wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT;
const TIMESTAMP_BYTES: u64 = 2 * wgpu::QUERY_SIZE as u64;
const MAX_TIMESTAMP_EVENTS: u32 = 1024;
const UNIFORM_ALIGNMENT: usize = 16;
/// Optional features requested whenever the adapter offers them.
const OPTIONAL_FEATURES: Features = Features::TIMESTAMP_QUERY
    .union(Features::SHADER_F16)
    .union(Features::SHADER_F64);

struct GpuDevice {
    name: String,
    device_type: DeviceType,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: Limits,
    features: Features,
}

struct GpuModule {
    device: usize,
    library: KernelLibrary,
}

struct GpuBuffer {
    device: usize,
    size: u64,
    buffer: wgpu::Buffer,
}

enum GpuArg {
    Buffer(BufferId),
    Uniform(wgpu::Buffer),
}

struct GpuKernel {
    device: usize,
    name: String,
    wgsl: String,
    signature: Vec<ArgKind>,
    args: Vec<Option<GpuArg>>,
    group_size: Option<[u32; 3]>,
    pipelines: HashMap<[u32; 3], Arc<wgpu::ComputePipeline>>,
}

enum GpuCommand {
    Launch {
        pipeline: Arc<wgpu::ComputePipeline>,
        bind_group: wgpu::BindGroup,
        counts: [u32; 3],
        signal: Option<EventId>,
    },
    Signal(EventId),
}

struct GpuList {
    device: usize,
    commands: Vec<GpuCommand>,
    closed: bool,
}

struct TimestampSlots {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
}

struct GpuPool {
    device: usize,
    count: u32,
    timestamps: Option<TimestampSlots>,
}

struct GpuEvent {
    pool: EventPoolId,
    index: u32,
    signaled: Arc<AtomicBool>,
}

pub struct WgpuDriver {
    devices: Vec<GpuDevice>,
    compute_units: Option<u32>,
    modules: Slab<GpuModule>,
    queues: Slab<usize>,
    lists: Slab<GpuList>,
    buffers: Slab<GpuBuffer>,
    kernels: Slab<GpuKernel>,
    pools: Slab<GpuPool>,
    events: Slab<GpuEvent>,
}

impl WgpuDriver {
    /// Opens up to `max_devices` adapters of `backends`, in enumeration order.
    pub fn new(backends: Backends, max_devices: usize) -> Result<Self, Error> {
        let _span = info_span!("wgpu_init", ?backends, max_devices).entered();
        let instance = wgpu::Instance::new(InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(backends);
        if adapters.is_empty() {
            return Err(Error::GpuInit(format!("no adapter for backends {:?}", backends)));
        }

        let mut devices = Vec::new();
        for adapter in adapters.into_iter().take(max_devices.max(1)) {
            let adapter_info = adapter.get_info();
            let features = adapter.features() & OPTIONAL_FEATURES;
            let limits = adapter.limits();

            let (device, queue) = block_on(adapter.request_device(
                &DeviceDescriptor {
                    label: Some(adapter_info.name.as_str()),
                    required_features: features,
                    required_limits: limits.clone(),
                },
                None,
            ))
            .map_err(|e| Error::GpuInit(format!("{}: {}", adapter_info.name, e)))?;

            device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
                error!(error = %e, "wgpu_uncaptured_error");
            }));
            info!(
                name = %adapter_info.name,
                backend = ?adapter_info.backend,
                device_type = ?adapter_info.device_type,
                ?features,
                "GPU device created"
            );

            devices.push(GpuDevice {
                name: adapter_info.name,
                device_type: adapter_info.device_type,
                device,
                queue,
                limits,
                features,
            });
        }

        Ok(Self {
            devices,
            compute_units: None,
            modules: Slab::new(),
            queues: Slab::new(),
            lists: Slab::new(),
            buffers: Slab::new(),
            kernels: Slab::new(),
            pools: Slab::new(),
            events: Slab::new(),
        })
    }

    /// wgpu does not report a compute-unit count; this replaces the estimate.
    pub fn with_compute_units(mut self, compute_units: Option<u32>) -> Self {
        self.compute_units = compute_units;
        self
    }

    fn gpu(&self, device: usize, op: &'static str) -> Result<&GpuDevice, Error> {
        self.devices
            .get(device)
            .ok_or(Error::driver(op, ResultCode::InvalidArgument))
    }

    fn pipeline(&mut self, kernel: KernelId, size: [u32; 3]) -> Result<Arc<wgpu::ComputePipeline>, Error> {
        const OP: &str = "append_launch";
        let entry = self.kernels.get_mut(kernel.0, OP)?;
        if let Some(pipeline) = entry.pipelines.get(&size) {
            return Ok(pipeline.clone());
        }

        let gpu = self
            .devices
            .get(entry.device)
            .ok_or(Error::driver(OP, ResultCode::InvalidNullHandle))?;
        let source = with_group_size(&entry.wgsl, size);
        let pipeline = scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::InvalidArgument, || {
            let module = gpu.device.create_shader_module(ShaderModuleDescriptor {
                label: Some(entry.name.as_str()),
                source: ShaderSource::Wgsl(source.into()),
            });
            Ok(gpu.device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(entry.name.as_str()),
                layout: None,
                module: &module,
                entry_point: &entry.name,
                compilation_options: PipelineCompilationOptions::default(),
            }))
        })?;
        debug!(kernel = %entry.name, ?size, "pipeline_compiled");

        let pipeline = Arc::new(pipeline);
        entry.pipelines.insert(size, pipeline.clone());
        Ok(pipeline)
    }

    fn bind_group(
        &self,
        kernel: KernelId,
        pipeline: &wgpu::ComputePipeline,
    ) -> Result<wgpu::BindGroup, Error> {
        const OP: &str = "append_launch";
        let entry = self.kernels.get(kernel.0, OP)?;
        let gpu = self.gpu(entry.device, OP)?;

        let mut entries = Vec::with_capacity(entry.args.len());
        for (binding, arg) in entry.args.iter().enumerate() {
            let resource = match arg {
                Some(GpuArg::Buffer(id)) => self.buffers.get(id.0, OP)?.buffer.as_entire_binding(),
                Some(GpuArg::Uniform(buffer)) => buffer.as_entire_binding(),
                None => return Err(Error::driver(OP, ResultCode::InvalidArgument)),
            };
            entries.push(BindGroupEntry {
                binding: binding as u32,
                resource,
            });
        }

        scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::InvalidArgument, || {
            Ok(gpu.device.create_bind_group(&BindGroupDescriptor {
                label: Some(entry.name.as_str()),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            }))
        })
    }

    fn timestamp_slot(&self, event: EventId, op: &'static str) -> Result<Option<(&TimestampSlots, u32)>, Error> {
        let entry = self.events.get(event.0, op)?;
        let pool = self.pools.get(entry.pool.0, op)?;
        Ok(pool.timestamps.as_ref().map(|slots| (slots, entry.index)))
    }

    fn signal_on_completion(&self, gpu: &GpuDevice, encoder: CommandEncoder, event: EventId) -> Result<(), Error> {
        let flag = self.events.get(event.0, "execute_list")?.signaled.clone();
        gpu.queue.submit(Some(encoder.finish()));
        gpu.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
        Ok(())
    }

    fn encode_and_submit(&self, gpu: &GpuDevice, list: &GpuList) -> Result<(), Error> {
        const OP: &str = "execute_list";
        let new_encoder = || {
            gpu.device.create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Command List"),
            })
        };

        let mut encoder = new_encoder();
        for command in &list.commands {
            match command {
                GpuCommand::Launch {
                    pipeline,
                    bind_group,
                    counts,
                    signal,
                } => {
                    let slot = match signal {
                        Some(event) => self.timestamp_slot(*event, OP)?,
                        None => None,
                    };
                    {
                        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                            label: Some("Launch"),
                            timestamp_writes: slot.map(|(slots, index)| ComputePassTimestampWrites {
                                query_set: &slots.query_set,
                                beginning_of_pass_write_index: Some(2 * index),
                                end_of_pass_write_index: Some(2 * index + 1),
                            }),
                        });
                        pass.set_pipeline(pipeline);
                        pass.set_bind_group(0, bind_group, &[]);
                        pass.dispatch_workgroups(counts[0], counts[1], counts[2]);
                    }
                    if let Some((slots, index)) = slot {
                        let offset = index as u64 * TIMESTAMP_STRIDE;
                        encoder.resolve_query_set(&slots.query_set, 2 * index..2 * index + 2, &slots.resolve, offset);
                        encoder.copy_buffer_to_buffer(&slots.resolve, offset, &slots.readback, offset, TIMESTAMP_BYTES);
                    }
                    if let Some(event) = signal {
                        let done = std::mem::replace(&mut encoder, new_encoder());
                        self.signal_on_completion(gpu, done, *event)?;
                    }
                }
                GpuCommand::Signal(event) => {
                    let done = std::mem::replace(&mut encoder, new_encoder());
                    self.signal_on_completion(gpu, done, *event)?;
                }
            }
        }
        gpu.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

/// Runs `f` inside a wgpu error scope and maps a captured error to `code`.
fn scoped<T>(
    device: &wgpu::Device,
    filter: ErrorFilter,
    op: &'static str,
    code: ResultCode,
    f: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    device.push_error_scope(filter);
    let value = f();
    if let Some(e) = block_on(device.pop_error_scope()) {
        warn!(op, error = %e, "wgpu_error");
        return Err(Error::driver(op, code));
    }
    value
}

/// Byte range of a host copy; reads are widened to wgpu's copy alignment.
fn copy_range(
    entry: &GpuBuffer,
    offset: usize,
    len: usize,
    op: &'static str,
) -> Result<std::ops::Range<u64>, Error> {
    let start = offset as u64;
    let end = start
        .checked_add(len as u64)
        .filter(|&end| end <= entry.size)
        .ok_or(Error::driver(op, ResultCode::InvalidSize))?;
    if start % wgpu::COPY_BUFFER_ALIGNMENT != 0 || len == 0 {
        return Err(Error::driver(op, ResultCode::InvalidSize));
    }
    Ok(start..end.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT)
}

/// wgpu has no compute-unit query; a rough count by device class.
fn estimated_compute_units(device_type: DeviceType) -> u32 {
    match device_type {
        DeviceType::DiscreteGpu => 32,
        DeviceType::IntegratedGpu | DeviceType::VirtualGpu => 8,
        DeviceType::Cpu | DeviceType::Other => 4,
    }
}

impl Driver for WgpuDriver {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn capability(&self, device: usize) -> Result<DeviceCapability, Error> {
        let gpu = self.gpu(device, "capability")?;
        let limits = &gpu.limits;
        let period = gpu.queue.get_timestamp_period() as f64;
        Ok(DeviceCapability {
            name: gpu.name.clone(),
            max_group_size_x: limits.max_compute_workgroup_size_x,
            max_group_size_y: limits.max_compute_workgroup_size_y,
            max_group_size_z: limits.max_compute_workgroup_size_z,
            max_group_count_x: limits.max_compute_workgroups_per_dimension,
            max_group_count_y: limits.max_compute_workgroups_per_dimension,
            max_group_count_z: limits.max_compute_workgroups_per_dimension,
            max_invocations_per_group: limits.max_compute_invocations_per_workgroup,
            compute_units: self
                .compute_units
                .unwrap_or_else(|| estimated_compute_units(gpu.device_type)),
            max_alloc_size: limits
                .max_buffer_size
                .min(limits.max_storage_buffer_binding_size as u64),
            timer_resolution_ns: if period > 0.0 { period } else { 1.0 },
            kernel_timestamp_valid_bits: 64,
            kernel_timestamps: gpu.features.contains(Features::TIMESTAMP_QUERY),
            fp16: gpu.features.contains(Features::SHADER_F16),
            fp64: gpu.features.contains(Features::SHADER_F64),
        })
    }

    fn create_module(&mut self, device: usize, library: &KernelLibrary) -> Result<ModuleId, Error> {
        const OP: &str = "create_module";
        let capability = self.capability(device)?;
        let gpu = self.gpu(device, OP)?;
        // Every kernel the device can run must at least parse; group sizes
        // are filled in per launch.
        for name in library.names() {
            let Some(source) = library.get(name) else {
                continue;
            };
            if source.requires.is_some_and(|feature| !feature.supported_by(&capability)) {
                debug!(device, kernel = name, "kernel_skipped_unsupported");
                continue;
            }
            let wgsl = with_group_size(&source.wgsl, [1, 1, 1]);
            scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::InvalidArgument, || {
                gpu.device.create_shader_module(ShaderModuleDescriptor {
                    label: Some(name),
                    source: ShaderSource::Wgsl(wgsl.into()),
                });
                Ok(())
            })?;
        }
        debug!(device, "module_created");
        Ok(ModuleId(self.modules.insert(GpuModule {
            device,
            library: library.clone(),
        })))
    }

    fn destroy_module(&mut self, module: ModuleId) -> Result<(), Error> {
        self.modules.remove(module.0, "destroy_module").map(|_| ())
    }

    fn create_queue(&mut self, device: usize) -> Result<QueueId, Error> {
        self.gpu(device, "create_queue")?;
        Ok(QueueId(self.queues.insert(device)))
    }

    fn destroy_queue(&mut self, queue: QueueId) -> Result<(), Error> {
        self.queues.remove(queue.0, "destroy_queue").map(|_| ())
    }

    fn create_list(&mut self, device: usize) -> Result<ListId, Error> {
        self.gpu(device, "create_list")?;
        Ok(ListId(self.lists.insert(GpuList {
            device,
            commands: Vec::new(),
            closed: false,
        })))
    }

    fn destroy_list(&mut self, list: ListId) -> Result<(), Error> {
        self.lists.remove(list.0, "destroy_list").map(|_| ())
    }

    fn allocate(&mut self, device: usize, size: usize) -> Result<BufferId, Error> {
        const OP: &str = "allocate";
        let capability = self.capability(device)?;
        if size == 0 {
            return Err(Error::driver(OP, ResultCode::InvalidSize));
        }
        let size = (size as u64).div_ceil(4) * 4;
        if size > capability.max_alloc_size {
            return Err(Error::driver(OP, ResultCode::OutOfDeviceMemory));
        }

        let gpu = self.gpu(device, OP)?;
        let buffer = scoped(&gpu.device, ErrorFilter::OutOfMemory, OP, ResultCode::OutOfDeviceMemory, || {
            Ok(gpu.device.create_buffer(&BufferDescriptor {
                label: Some("Device Buffer"),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }))
        })?;
        debug!(device, size, "buffer_allocated");
        Ok(BufferId(self.buffers.insert(GpuBuffer { device, size, buffer })))
    }

    fn free(&mut self, buffer: BufferId) -> Result<(), Error> {
        let entry = self.buffers.remove(buffer.0, "free")?;
        debug!(device = entry.device, size = entry.size, "buffer_freed");
        entry.buffer.destroy();
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<(), Error> {
        const OP: &str = "write_buffer";
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::driver(OP, ResultCode::InvalidSize));
        }
        let entry = self.buffers.get(buffer.0, OP)?;
        let range = copy_range(entry, offset, data.len(), OP)?;
        let gpu = self.gpu(entry.device, OP)?;
        scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::InvalidArgument, || {
            gpu.queue.write_buffer(&entry.buffer, range.start, data);
            gpu.queue.submit(None);
            Ok(())
        })?;
        gpu.device.poll(Maintain::Wait);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<(), Error> {
        const OP: &str = "read_buffer";
        let entry = self.buffers.get(buffer.0, OP)?;
        let range = copy_range(entry, offset, out.len(), OP)?;
        let gpu = self.gpu(entry.device, OP)?;
        let size = range.end - range.start;

        let staging = scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::InvalidArgument, || {
            let staging = gpu.device.create_buffer(&BufferDescriptor {
                label: Some("Readback Buffer"),
                size,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = gpu.device.create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Readback"),
            });
            encoder.copy_buffer_to_buffer(&entry.buffer, range.start, &staging, 0, size);
            gpu.queue.submit(Some(encoder.finish()));
            Ok(staging)
        })?;

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(Maintain::Wait);
        match rx.try_recv() {
            Ok(Ok(())) => {}
            _ => {
                staging.destroy();
                return Err(Error::driver(OP, ResultCode::DeviceLost));
            }
        }
        out.copy_from_slice(&slice.get_mapped_range()[..out.len()]);
        staging.unmap();
        staging.destroy();
        Ok(())
    }

    fn create_kernel(&mut self, module: ModuleId, name: &str) -> Result<KernelId, Error> {
        const OP: &str = "create_kernel";
        let module = self.modules.get(module.0, OP)?;
        let source = module
            .library
            .get(name)
            .ok_or(Error::driver(OP, ResultCode::InvalidArgument))?;
        let device = module.device;
        let source = source.clone();
        if let Some(feature) = source.requires {
            if !feature.supported_by(&self.capability(device)?) {
                return Err(Error::driver(OP, ResultCode::UnsupportedFeature));
            }
        }
        let kernel = GpuKernel {
            device,
            name: name.to_string(),
            args: source.arguments.iter().map(|_| None).collect(),
            signature: source.arguments,
            wgsl: source.wgsl,
            group_size: None,
            pipelines: HashMap::new(),
        };
        Ok(KernelId(self.kernels.insert(kernel)))
    }

    fn destroy_kernel(&mut self, kernel: KernelId) -> Result<(), Error> {
        self.kernels.remove(kernel.0, "destroy_kernel").map(|_| ())
    }

    fn set_kernel_argument(
        &mut self,
        kernel: KernelId,
        index: u32,
        arg: KernelArg<'_>,
    ) -> Result<(), Error> {
        const OP: &str = "set_kernel_argument";
        let entry = self.kernels.get(kernel.0, OP)?;
        let kernel_device = entry.device;
        let kind = entry
            .signature
            .get(index as usize)
            .copied()
            .ok_or(Error::driver(OP, ResultCode::InvalidArgument))?;
        let value = match (kind, arg) {
            (ArgKind::Buffer, KernelArg::Buffer(buffer)) => {
                if self.buffers.get(buffer.0, OP)?.device != kernel_device {
                    // No peer access between wgpu devices.
                    return Err(Error::driver(OP, ResultCode::UnsupportedFeature));
                }
                GpuArg::Buffer(buffer)
            }
            (ArgKind::Scalar(size), KernelArg::Bytes(bytes)) => {
                if bytes.len() != size {
                    return Err(Error::driver(OP, ResultCode::InvalidSize));
                }
                let gpu = self.gpu(kernel_device, OP)?;
                let mut padded = bytes.to_vec();
                padded.resize(bytes.len().div_ceil(UNIFORM_ALIGNMENT).max(1) * UNIFORM_ALIGNMENT, 0);
                let buffer = gpu.device.create_buffer(&BufferDescriptor {
                    label: Some("Kernel Argument"),
                    size: padded.len() as u64,
                    usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                gpu.queue.write_buffer(&buffer, 0, &padded);
                GpuArg::Uniform(buffer)
            }
            _ => return Err(Error::driver(OP, ResultCode::InvalidArgument)),
        };

        let slot = self
            .kernels
            .get_mut(kernel.0, OP)?
            .args
            .get_mut(index as usize)
            .ok_or(Error::driver(OP, ResultCode::InvalidArgument))?;
        *slot = Some(value);
        Ok(())
    }

    fn suggest_group_size(&mut self, kernel: KernelId, global: [u32; 3]) -> Result<[u32; 3], Error> {
        let device = self.kernels.get(kernel.0, "suggest_group_size")?.device;
        let capability = self.capability(device)?;
        Ok(suggest_group_size(
            global,
            capability.max_group_size(),
            capability.max_invocations_per_group,
        ))
    }

    fn set_group_size(&mut self, kernel: KernelId, size: [u32; 3]) -> Result<(), Error> {
        const OP: &str = "set_group_size";
        let device = self.kernels.get(kernel.0, OP)?.device;
        let capability = self.capability(device)?;
        let fits = size
            .iter()
            .zip(capability.max_group_size())
            .all(|(&s, max)| s >= 1 && s <= max);
        let invocations: u64 = size.iter().map(|&s| s as u64).product();
        if !fits || invocations > capability.max_invocations_per_group as u64 {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        self.kernels.get_mut(kernel.0, OP)?.group_size = Some(size);
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
        let target = self.lists.get(list.0, OP)?;
        let entry = self.kernels.get(kernel.0, OP)?;
        if target.closed || target.device != entry.device {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        let group_size = entry
            .group_size
            .ok_or(Error::driver(OP, ResultCode::InvalidArgument))?;
        let max_count = self.gpu(entry.device, OP)?.limits.max_compute_workgroups_per_dimension;
        if counts.iter().any(|&c| c == 0 || c > max_count) {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        if let Some(event) = signal {
            let pool = self.events.get(event.0, OP)?.pool;
            if self.pools.get(pool.0, OP)?.device != target.device {
                return Err(Error::driver(OP, ResultCode::InvalidArgument));
            }
        }

        let pipeline = self.pipeline(kernel, group_size)?;
        let bind_group = self.bind_group(kernel, &pipeline)?;
        self.lists.get_mut(list.0, OP)?.commands.push(GpuCommand::Launch {
            pipeline,
            bind_group,
            counts,
            signal,
        });
        Ok(())
    }

    fn append_signal_event(&mut self, list: ListId, event: EventId) -> Result<(), Error> {
        const OP: &str = "append_signal_event";
        self.events.get(event.0, OP)?;
        let target = self.lists.get_mut(list.0, OP)?;
        if target.closed {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        target.commands.push(GpuCommand::Signal(event));
        Ok(())
    }

    fn close_list(&mut self, list: ListId) -> Result<(), Error> {
        self.lists.get_mut(list.0, "close_list")?.closed = true;
        Ok(())
    }

    fn execute_list(&mut self, queue: QueueId, list: ListId) -> Result<(), Error> {
        const OP: &str = "execute_list";
        let device = *self.queues.get(queue.0, OP)?;
        let target = self.lists.get(list.0, OP)?;
        if !target.closed || target.device != device {
            return Err(Error::driver(OP, ResultCode::InvalidArgument));
        }
        let gpu = self.gpu(device, OP)?;
        scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::InvalidArgument, || {
            self.encode_and_submit(gpu, target)
        })
    }

    fn synchronize_queue(&mut self, queue: QueueId, _timeout: u64) -> Result<(), Error> {
        let device = *self.queues.get(queue.0, "synchronize_queue")?;
        self.gpu(device, "synchronize_queue")?.device.poll(Maintain::Wait);
        Ok(())
    }

    fn reset_list(&mut self, list: ListId) -> Result<(), Error> {
        let target = self.lists.get_mut(list.0, "reset_list")?;
        target.commands.clear();
        target.closed = false;
        Ok(())
    }

    fn create_event_pool(
        &mut self,
        device: usize,
        flags: EventPoolFlags,
        count: u32,
    ) -> Result<EventPoolId, Error> {
        const OP: &str = "create_event_pool";
        let gpu = self.gpu(device, OP)?;
        if count == 0 || count > MAX_TIMESTAMP_EVENTS {
            return Err(Error::driver(OP, ResultCode::InvalidSize));
        }

        let timestamps = if flags.contains(EventPoolFlags::KERNEL_TIMESTAMP) {
            if !gpu.features.contains(Features::TIMESTAMP_QUERY) {
                return Err(Error::driver(OP, ResultCode::UnsupportedFeature));
            }
            let bytes = count as u64 * TIMESTAMP_STRIDE;
            Some(scoped(&gpu.device, ErrorFilter::Validation, OP, ResultCode::Unknown, || {
                Ok(TimestampSlots {
                    query_set: gpu.device.create_query_set(&QuerySetDescriptor {
                        label: Some("Kernel Timestamps"),
                        ty: QueryType::Timestamp,
                        count: 2 * count,
                    }),
                    resolve: gpu.device.create_buffer(&BufferDescriptor {
                        label: Some("Timestamp Resolve"),
                        size: bytes,
                        usage: BufferUsages::QUERY_RESOLVE | BufferUsages::COPY_SRC,
                        mapped_at_creation: false,
                    }),
                    readback: gpu.device.create_buffer(&BufferDescriptor {
                        label: Some("Timestamp Readback"),
                        size: bytes,
                        usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                        mapped_at_creation: false,
                    }),
                })
            })?)
        } else {
            None
        };

        Ok(EventPoolId(self.pools.insert(GpuPool {
            device,
            count,
            timestamps,
        })))
    }

    fn create_event(&mut self, pool: EventPoolId, index: u32) -> Result<EventId, Error> {
        if index >= self.pools.get(pool.0, "create_event")?.count {
            return Err(Error::driver("create_event", ResultCode::InvalidArgument));
        }
        Ok(EventId(self.events.insert(GpuEvent {
            pool,
            index,
            signaled: Arc::new(AtomicBool::new(false)),
        })))
    }

    fn host_wait(&mut self, event: EventId, _timeout: u64) -> Result<(), Error> {
        const OP: &str = "host_wait";
        let entry = self.events.get(event.0, OP)?;
        if entry.signaled.load(Ordering::Acquire) {
            return Ok(());
        }
        let device = self.pools.get(entry.pool.0, OP)?.device;
        self.gpu(device, OP)?.device.poll(Maintain::Wait);
        if entry.signaled.load(Ordering::Acquire) {
            Ok(())
        } else {
            // Idle device and still unsignaled: nothing submitted will signal it.
            Err(Error::driver(OP, ResultCode::NotReady))
        }
    }

    fn host_reset(&mut self, event: EventId) -> Result<(), Error> {
        self.events
            .get(event.0, "host_reset")?
            .signaled
            .store(false, Ordering::Release);
        Ok(())
    }

    fn query_timestamp(&mut self, event: EventId) -> Result<KernelTimestamp, Error> {
        const OP: &str = "query_timestamp";
        let entry = self.events.get(event.0, OP)?;
        if !entry.signaled.load(Ordering::Acquire) {
            return Err(Error::driver(OP, ResultCode::NotReady));
        }
        let pool = self.pools.get(entry.pool.0, OP)?;
        let slots = pool
            .timestamps
            .as_ref()
            .ok_or(Error::driver(OP, ResultCode::UnsupportedFeature))?;
        let gpu = self.gpu(pool.device, OP)?;

        let offset = entry.index as u64 * TIMESTAMP_STRIDE;
        let slice = slots.readback.slice(offset..offset + TIMESTAMP_BYTES);
        let (tx, rx) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(Maintain::Wait);
        match rx.try_recv() {
            Ok(Ok(())) => {}
            _ => return Err(Error::driver(OP, ResultCode::DeviceLost)),
        }

        let ticks = {
            let data = slice.get_mapped_range();
            let word = |i: usize| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[i * 8..i * 8 + 8]);
                u64::from_le_bytes(bytes)
            };
            KernelTimestamp {
                start: word(0),
                end: word(1),
            }
        };
        slots.readback.unmap();
        Ok(ticks)
    }

    fn destroy_event(&mut self, event: EventId) -> Result<(), Error> {
        self.events.remove(event.0, "destroy_event").map(|_| ())
    }

    fn destroy_event_pool(&mut self, pool: EventPoolId) -> Result<(), Error> {
        let entry = self.pools.remove(pool.0, "destroy_event_pool")?;
        if let Some(slots) = entry.timestamps {
            slots.resolve.destroy();
            slots.readback.destroy();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_unit_estimate_favours_discrete_parts() {
        assert!(estimated_compute_units(DeviceType::DiscreteGpu) > estimated_compute_units(DeviceType::IntegratedGpu));
        assert!(estimated_compute_units(DeviceType::Cpu) >= 1);
    }

    #[test]
    fn timestamp_slots_respect_resolve_alignment() {
        assert_eq!(TIMESTAMP_STRIDE % wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT, 0);
        assert_eq!(TIMESTAMP_BYTES, 16);
    }

    #[test]
    fn optional_features_cover_timestamps_and_precisions() {
        assert!(OPTIONAL_FEATURES.contains(Features::TIMESTAMP_QUERY));
        assert!(OPTIONAL_FEATURES.contains(Features::SHADER_F16 | Features::SHADER_F64));
    }
}
