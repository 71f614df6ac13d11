//! OpenCL backend via ocl: platform discovery, program builds with the
//! build log surfaced on failure, and per-flow command queues.

use std::sync::Arc;

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{
    Buffer, Context as OclContext, Device as OclDevice, Kernel as OclKernel, MemFlags, Platform,
    Program, Queue,
};

use crate::dims::Dimensions;
use crate::driver::codegen::{KernelGenerator, OpenClGenerator};
use crate::driver::launch::Launch;
use crate::driver::{
    ChunkedMemoryObject, Context, Device, Driver, ExecutionFlow, Kernel, KernelProgram,
    MemoryObject,
};
use crate::error::{Error, Result};

pub struct OpenCl;

impl Driver for OpenCl {
    const NAME: &'static str = "opencl";

    type Context = OpenClRuntime;
    type Device = OpenClGpu;
    type Program = OpenClProgram;
    type Kernel = OpenClKernel;
    type Memory = OpenClMemory;
    type ChunkedMemory = OpenClChunkedMemory;
    type Flow = OpenClFlow;
    type Generator = OpenClGenerator;
}

#[derive(Clone)]
pub struct OpenClRuntime {
    devices: Vec<Arc<OpenClGpu>>,
}

impl Context<OpenCl> for OpenClRuntime {
    fn init() -> Result<Self> {
        if Platform::list().is_empty() {
            log::debug!("no OpenCL platform available");
            return Ok(Self { devices: Vec::new() });
        }
        let platform = Platform::default();
        let found = OclDevice::list_all(platform)
            .map_err(|e| Error::native(format!("device enumeration failed: {e}"), crate::origin!()))?;
        let mut devices = Vec::with_capacity(found.len());
        for device in found {
            devices.push(Arc::new(OpenClGpu::query(platform, device)?));
        }
        log::debug!("found {} OpenCL device(s)", devices.len());
        Ok(Self { devices })
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, index: usize) -> Result<Arc<OpenClGpu>> {
        self.devices.get(index).cloned().ok_or(Error::NoDevice {
            index,
            available: self.devices.len(),
        })
    }
}

pub struct OpenClGpu {
    device: OclDevice,
    context: OclContext,
    queue: Queue,
    name: String,
    compute_units: u32,
    max_threads_per_block: usize,
    max_block_dims: [usize; 3],
    global_memory_bytes: usize,
    local_memory_bytes: usize,
    clock_rate_mhz: u32,
    integrated: bool,
}

// The wrapped OpenCL handles are reference counted and thread safe.
unsafe impl Send for OpenClGpu {}
unsafe impl Sync for OpenClGpu {}

impl OpenClGpu {
    /// Snapshots the device properties once at discovery.
    fn query(platform: Platform, device: OclDevice) -> Result<Self> {
        let context = OclContext::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| Error::native(format!("context creation failed: {e}"), crate::origin!()))?;
        let queue = Queue::new(&context, device, None)
            .map_err(|e| Error::native(format!("queue creation failed: {e}"), crate::origin!()))?;

        let name = device.name().unwrap_or_else(|_| "unknown device".to_string());
        let max_threads_per_block = device.max_wg_size().map_err(|e| {
            Error::native(format!("work-group query failed: {e}"), crate::origin!())
        })?;
        let max_block_dims = match device.info(DeviceInfo::MaxWorkItemSizes) {
            Ok(DeviceInfoResult::MaxWorkItemSizes(sizes)) => [
                sizes.first().copied().unwrap_or(1),
                sizes.get(1).copied().unwrap_or(1),
                sizes.get(2).copied().unwrap_or(1),
            ],
            _ => [max_threads_per_block, 1, 1],
        };
        let compute_units = match device.info(DeviceInfo::MaxComputeUnits) {
            Ok(DeviceInfoResult::MaxComputeUnits(units)) => units,
            _ => 1,
        };
        let global_memory_bytes = match device.info(DeviceInfo::GlobalMemSize) {
            Ok(DeviceInfoResult::GlobalMemSize(bytes)) => bytes as usize,
            _ => 0,
        };
        let local_memory_bytes = match device.info(DeviceInfo::LocalMemSize) {
            Ok(DeviceInfoResult::LocalMemSize(bytes)) => bytes as usize,
            _ => 0,
        };
        let clock_rate_mhz = match device.info(DeviceInfo::MaxClockFrequency) {
            Ok(DeviceInfoResult::MaxClockFrequency(mhz)) => mhz,
            _ => 0,
        };
        let integrated = matches!(
            device.info(DeviceInfo::HostUnifiedMemory),
            Ok(DeviceInfoResult::HostUnifiedMemory(true))
        );

        Ok(Self {
            device,
            context,
            queue,
            name,
            compute_units,
            max_threads_per_block,
            max_block_dims,
            global_memory_bytes,
            local_memory_bytes,
            clock_rate_mhz,
            integrated,
        })
    }

    fn buffer_flags(read_only: bool, write_only: bool) -> MemFlags {
        let mut flags = MemFlags::new();
        if read_only {
            flags = flags.read_only();
        } else if write_only {
            flags = flags.write_only();
        } else {
            flags = flags.read_write();
        }
        flags
    }
}

impl Device<OpenCl> for OpenClGpu {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn compute_units(&self) -> u32 {
        self.compute_units
    }
    fn warp_size(&self) -> u32 {
        // No portable query; the launch mapping does not rely on it.
        1
    }
    fn max_threads_per_block(&self) -> usize {
        self.max_threads_per_block
    }
    fn max_block_dims(&self) -> [usize; 3] {
        self.max_block_dims
    }
    fn max_registers_per_block(&self) -> usize {
        // Not exposed by OpenCL; a zero register count disables the
        // register ceiling in the launch mapping.
        0
    }
    fn global_memory_bytes(&self) -> usize {
        self.global_memory_bytes
    }
    fn local_memory_bytes(&self) -> usize {
        self.local_memory_bytes
    }
    fn clock_rate_mhz(&self) -> u32 {
        self.clock_rate_mhz
    }
    fn is_integrated(&self) -> bool {
        self.integrated
    }

    fn new_flow(self: &Arc<Self>) -> Result<OpenClFlow> {
        let queue = Queue::new(&self.context, self.device, None)
            .map_err(|e| Error::native(format!("queue creation failed: {e}"), crate::origin!()))?;
        Ok(OpenClFlow { queue })
    }

    fn malloc(
        self: &Arc<Self>,
        size: usize,
        host: *mut u8,
        read_only: bool,
        write_only: bool,
    ) -> Result<OpenClMemory> {
        let buffer = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .len(size.max(1))
            .flags(Self::buffer_flags(read_only, write_only))
            .build()
            .map_err(|e| {
                Error::native(
                    format!("OpenCL allocation of {size} byte(s) failed: {e}"),
                    crate::origin!(),
                )
            })?;
        Ok(OpenClMemory {
            buffer,
            host,
            host_size: size,
            read_only,
            write_only,
        })
    }

    fn malloc_chunked(
        self: &Arc<Self>,
        chunk_size: usize,
        chunks: &[*mut u8],
        read_only: bool,
        write_only: bool,
    ) -> Result<OpenClChunkedMemory> {
        let total = chunk_size * chunks.len();
        let buffer = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .len(total.max(1))
            .flags(Self::buffer_flags(read_only, write_only))
            .build()
            .map_err(|e| {
                Error::native(
                    format!("OpenCL chunked allocation of {total} byte(s) failed: {e}"),
                    crate::origin!(),
                )
            })?;
        Ok(OpenClChunkedMemory {
            buffer,
            hosts: chunks.to_vec(),
            chunk_size,
        })
    }

    fn prepare_kernel(self: &Arc<Self>, source: &str, kernel_name: &str) -> Result<OpenClProgram> {
        let programs = self.prepare_kernels(source, &[kernel_name.to_string()])?;
        programs
            .into_iter()
            .next()
            .ok_or_else(|| Error::native("no kernel prepared", crate::origin!()))
    }

    fn prepare_kernels(
        self: &Arc<Self>,
        source: &str,
        kernel_names: &[String],
    ) -> Result<Vec<OpenClProgram>> {
        let generator = OpenClGenerator;
        let complete = format!(
            "{}{}",
            generator.std_functions(),
            generator.replace_macro_keywords(source)
        );
        log::debug!(
            "building {} OpenCL kernel(s) on '{}'",
            kernel_names.len(),
            self.name
        );
        // The ocl build error carries the compiler's build log.
        let program = Program::builder()
            .src(complete)
            .devices(self.device)
            .build(&self.context)
            .map_err(|e| Error::Compilation {
                message: format!("OpenCL build rejected kernel(s) {kernel_names:?}"),
                log: e.to_string(),
            })?;
        Ok(kernel_names
            .iter()
            .map(|name| OpenClProgram {
                entry_point: name.clone(),
                program: program.clone(),
                queue: self.queue.clone(),
                limits: self.limits(),
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct OpenClProgram {
    entry_point: String,
    program: Program,
    queue: Queue,
    limits: crate::driver::DeviceLimits,
}

// Program and queue handles are reference counted and thread safe.
unsafe impl Send for OpenClProgram {}
unsafe impl Sync for OpenClProgram {}

impl KernelProgram<OpenCl> for OpenClProgram {
    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn instantiate(&self) -> Result<OpenClKernel> {
        Ok(OpenClKernel {
            entry_point: self.entry_point.clone(),
            program: self.program.clone(),
            queue: self.queue.clone(),
            limits: self.limits,
            args: Vec::new(),
            shared_bytes: 0,
            overrides: [0; 3],
        })
    }
}

enum ClArg {
    Value(Vec<u8>),
    Buffer(Buffer<u8>),
}

pub struct OpenClKernel {
    entry_point: String,
    program: Program,
    queue: Queue,
    limits: crate::driver::DeviceLimits,
    args: Vec<ClArg>,
    shared_bytes: usize,
    overrides: [usize; 3],
}

// Buffer handles are reference counted; the binding itself is owned per
// pattern instance.
unsafe impl Send for OpenClKernel {}

impl Kernel<OpenCl> for OpenClKernel {
    fn clear_args(&mut self) {
        self.args.clear();
        self.shared_bytes = 0;
    }

    fn set_value_arg(&mut self, bytes: &[u8]) -> Result<()> {
        self.args.push(ClArg::Value(bytes.to_vec()));
        Ok(())
    }

    fn set_memory_arg(&mut self, memory: &OpenClMemory) -> Result<()> {
        self.args.push(ClArg::Buffer(memory.buffer.clone()));
        Ok(())
    }

    fn set_chunked_arg(&mut self, memory: &OpenClChunkedMemory) -> Result<()> {
        self.args.push(ClArg::Buffer(memory.buffer.clone()));
        Ok(())
    }

    fn set_shared_memory_bytes(&mut self, bytes: usize) {
        self.shared_bytes = bytes;
    }

    fn set_threads_per_block(&mut self, axis: usize, threads: usize) {
        self.overrides[axis] = threads;
    }

    fn registers_used(&self) -> u32 {
        0
    }

    fn blocks_and_threads_for(&self, dims: &Dimensions) -> Result<Launch> {
        crate::driver::launch::blocks_and_threads(
            dims,
            &self.limits,
            self.registers_used(),
            &self.overrides,
        )
    }

    fn run_async(&mut self, dims: &Dimensions, flow: &OpenClFlow) -> Result<()> {
        let launch = self.blocks_and_threads_for(dims)?;
        let grid = launch.grid();
        let block = launch.block();
        let global = [grid[0] * block[0], grid[1] * block[1], grid[2] * block[2]];

        let mut builder = OclKernel::builder();
        builder
            .program(&self.program)
            .name(&self.entry_point)
            .queue(flow.queue.clone())
            .global_work_size(global)
            .local_work_size(block);
        for arg in &self.args {
            match arg {
                ClArg::Value(bytes) => match bytes.len() {
                    8 => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(bytes);
                        builder.arg(u64::from_ne_bytes(raw));
                    }
                    4 => {
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(bytes);
                        builder.arg(u32::from_ne_bytes(raw));
                    }
                    2 => {
                        let mut raw = [0u8; 2];
                        raw.copy_from_slice(bytes);
                        builder.arg(u16::from_ne_bytes(raw));
                    }
                    1 => {
                        builder.arg(bytes[0]);
                    }
                    width => {
                        return Err(Error::native(
                            format!("unsupported scalar argument width {width}"),
                            crate::origin!(),
                        ));
                    }
                },
                ClArg::Buffer(buffer) => {
                    builder.arg(buffer);
                }
            }
        }
        if self.shared_bytes > 0 {
            builder.arg_local::<u8>(self.shared_bytes);
        }
        let kernel = builder.build().map_err(|e| {
            Error::native(
                format!("argument binding of '{}' failed: {e}", self.entry_point),
                crate::origin!(),
            )
        })?;
        log::debug!(
            "launching '{}' with global={global:?}, local={block:?}, {} arg(s)",
            self.entry_point,
            self.args.len()
        );
        unsafe {
            kernel.enq().map_err(|e| {
                Error::native(
                    format!("launch of '{}' failed: {e}", self.entry_point),
                    crate::origin!(),
                )
            })?;
        }
        self.queue = flow.queue.clone();
        Ok(())
    }

    fn wait_async(&mut self) -> Result<()> {
        self.queue.finish().map_err(|e| {
            Error::native(
                format!("synchronization after '{}' failed: {e}", self.entry_point),
                crate::origin!(),
            )
        })
    }
}

pub struct OpenClMemory {
    buffer: Buffer<u8>,
    host: *mut u8,
    host_size: usize,
    read_only: bool,
    write_only: bool,
}

// The host pointer is owned by the caller, who keeps it valid for the
// lifetime of the owning parameter.
unsafe impl Send for OpenClMemory {}

impl MemoryObject<OpenCl> for OpenClMemory {
    fn size(&self) -> usize {
        self.buffer.len()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_write_only(&self) -> bool {
        self.write_only
    }

    fn bind_to(&mut self, host: *mut u8, size: usize) {
        self.host = host;
        self.host_size = size;
    }

    fn pin_host_memory(&mut self) -> Result<()> {
        // Transfers already go through queue-ordered copies.
        Ok(())
    }

    fn copy_in(&mut self) -> Result<()> {
        if self.host.is_null() {
            return Err(Error::native("copy-in without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.buffer.len());
        let src = unsafe { std::slice::from_raw_parts(self.host, len) };
        self.buffer
            .write(src)
            .enq()
            .map_err(|e| Error::native(format!("host-to-device copy failed: {e}"), crate::origin!()))
    }

    fn copy_out(&mut self) -> Result<()> {
        if self.host.is_null() {
            return Err(Error::native("copy-out without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.buffer.len());
        let dst = unsafe { std::slice::from_raw_parts_mut(self.host, len) };
        self.buffer
            .read(dst)
            .enq()
            .map_err(|e| Error::native(format!("device-to-host copy failed: {e}"), crate::origin!()))
    }

    fn copy_in_async(&mut self, flow: &OpenClFlow) -> Result<()> {
        if self.host.is_null() {
            return Err(Error::native("copy-in without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.buffer.len());
        let src = unsafe { std::slice::from_raw_parts(self.host, len) };
        self.buffer
            .write(src)
            .queue(&flow.queue)
            .enq()
            .map_err(|e| Error::native(format!("host-to-device copy failed: {e}"), crate::origin!()))
    }

    fn copy_out_async(&mut self, flow: &OpenClFlow) -> Result<()> {
        if self.host.is_null() {
            return Err(Error::native("copy-out without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.buffer.len());
        let dst = unsafe { std::slice::from_raw_parts_mut(self.host, len) };
        self.buffer
            .read(dst)
            .queue(&flow.queue)
            .enq()
            .map_err(|e| Error::native(format!("device-to-host copy failed: {e}"), crate::origin!()))
    }

    fn wait_async(&mut self) -> Result<()> {
        // Reads and writes are enqueued blocking.
        Ok(())
    }
}

pub struct OpenClChunkedMemory {
    buffer: Buffer<u8>,
    hosts: Vec<*mut u8>,
    chunk_size: usize,
}

// Same contract as OpenClMemory: chunk pointers outlive the parameter.
unsafe impl Send for OpenClChunkedMemory {}

impl OpenClChunkedMemory {
    fn copy(&mut self, into_device: bool, chunks: usize, queue: Option<&Queue>) -> Result<()> {
        for chunk in 0..chunks.min(self.hosts.len()) {
            let host = self.hosts[chunk];
            if host.is_null() {
                return Err(Error::native(
                    format!("chunk {chunk} has no host binding"),
                    crate::origin!(),
                ));
            }
            let offset = chunk * self.chunk_size;
            if into_device {
                let src = unsafe { std::slice::from_raw_parts(host, self.chunk_size) };
                let mut cmd = self.buffer.write(src).offset(offset);
                if let Some(queue) = queue {
                    cmd = cmd.queue(queue);
                }
                cmd.enq().map_err(|e| {
                    Error::native(
                        format!("host-to-device copy of chunk {chunk} failed: {e}"),
                        crate::origin!(),
                    )
                })?;
            } else {
                let dst = unsafe { std::slice::from_raw_parts_mut(host, self.chunk_size) };
                let mut cmd = self.buffer.read(dst).offset(offset);
                if let Some(queue) = queue {
                    cmd = cmd.queue(queue);
                }
                cmd.enq().map_err(|e| {
                    Error::native(
                        format!("device-to-host copy of chunk {chunk} failed: {e}"),
                        crate::origin!(),
                    )
                })?;
            }
        }
        Ok(())
    }
}

impl ChunkedMemoryObject<OpenCl> for OpenClChunkedMemory {
    fn chunk_count(&self) -> usize {
        self.hosts.len()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn copy_in(&mut self, chunks: usize) -> Result<()> {
        self.copy(true, chunks, None)
    }

    fn copy_out(&mut self, chunks: usize) -> Result<()> {
        self.copy(false, chunks, None)
    }

    fn copy_in_async(&mut self, chunks: usize, flow: &OpenClFlow) -> Result<()> {
        let queue = flow.queue.clone();
        self.copy(true, chunks, Some(&queue))
    }

    fn copy_out_async(&mut self, chunks: usize, flow: &OpenClFlow) -> Result<()> {
        let queue = flow.queue.clone();
        self.copy(false, chunks, Some(&queue))
    }

    fn wait_async(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct OpenClFlow {
    queue: Queue,
}

// Queues are reference counted and safe to hand across threads.
unsafe impl Send for OpenClFlow {}

impl ExecutionFlow<OpenCl> for OpenClFlow {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.queue.finish().map_err(|e| {
            Error::native(format!("queue synchronization failed: {e}"), crate::origin!())
        })
    }
}
