//! CUDA backend: NVRTC compilation and driver-API execution via cudarc.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{
    sys, CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use crate::dims::Dimensions;
use crate::driver::codegen::{CudaGenerator, KernelGenerator};
use crate::driver::launch::Launch;
use crate::driver::{
    ChunkedMemoryObject, Context, Device, Driver, ExecutionFlow, Kernel, KernelProgram,
    MemoryObject,
};
use crate::error::{Error, Result};

const MAX_PROBED_DEVICES: usize = 16;

pub struct Cuda;

impl Driver for Cuda {
    const NAME: &'static str = "cuda";

    type Context = CudaRuntime;
    type Device = CudaGpu;
    type Program = CudaProgram;
    type Kernel = CudaKernel;
    type Memory = CudaMemory;
    type ChunkedMemory = CudaChunkedMemory;
    type Flow = CudaFlow;
    type Generator = CudaGenerator;
}

#[derive(Clone)]
pub struct CudaRuntime {
    devices: Vec<Arc<CudaGpu>>,
}

impl Context<Cuda> for CudaRuntime {
    fn init() -> Result<Self> {
        let mut devices = Vec::new();
        for index in 0..MAX_PROBED_DEVICES {
            match CudaContext::new(index) {
                Ok(context) => devices.push(Arc::new(CudaGpu::query(index, context)?)),
                Err(_) => break,
            }
        }
        log::debug!("found {} CUDA device(s)", devices.len());
        Ok(Self { devices })
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, index: usize) -> Result<Arc<CudaGpu>> {
        self.devices.get(index).cloned().ok_or(Error::NoDevice {
            index,
            available: self.devices.len(),
        })
    }
}

pub struct CudaGpu {
    index: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    name: String,
    compute_units: u32,
    warp_size: u32,
    max_threads_per_block: usize,
    max_block_dims: [usize; 3],
    max_registers_per_block: usize,
    global_memory_bytes: usize,
    local_memory_bytes: usize,
    clock_rate_mhz: u32,
    integrated: bool,
}

impl CudaGpu {
    /// Snapshots the device properties once; the getters never touch the
    /// driver again.
    fn query(index: usize, context: Arc<CudaContext>) -> Result<Self> {
        use sys::CUdevice_attribute as Attr;
        let attr = |a: Attr| -> Result<i32> {
            context.attribute(a).map_err(|e| {
                Error::native(
                    format!("attribute query failed on CUDA device {index}: {e}"),
                    crate::origin!(),
                )
            })
        };
        let name = context.name().map_err(|e| {
            Error::native(
                format!("name query failed on CUDA device {index}: {e}"),
                crate::origin!(),
            )
        })?;
        let global_memory_bytes = cudarc::driver::result::device::get(index as i32)
            .and_then(cudarc::driver::result::device::total_mem)
            .unwrap_or(0);
        let compute_units = attr(Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)? as u32;
        let warp_size = attr(Attr::CU_DEVICE_ATTRIBUTE_WARP_SIZE)? as u32;
        let max_threads_per_block =
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)? as usize;
        let max_block_dims = [
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)? as usize,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)? as usize,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z)? as usize,
        ];
        let max_registers_per_block =
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK)? as usize;
        let local_memory_bytes =
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)? as usize;
        let clock_rate_mhz = attr(Attr::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)? as u32 / 1000;
        let integrated = attr(Attr::CU_DEVICE_ATTRIBUTE_INTEGRATED)? != 0;
        Ok(Self {
            index,
            stream: context.default_stream(),
            context,
            name,
            compute_units,
            warp_size,
            max_threads_per_block,
            max_block_dims,
            max_registers_per_block,
            global_memory_bytes,
            local_memory_bytes,
            clock_rate_mhz,
            integrated,
        })
    }
}

impl Device<Cuda> for CudaGpu {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn compute_units(&self) -> u32 {
        self.compute_units
    }
    fn warp_size(&self) -> u32 {
        self.warp_size
    }
    fn max_threads_per_block(&self) -> usize {
        self.max_threads_per_block
    }
    fn max_block_dims(&self) -> [usize; 3] {
        self.max_block_dims
    }
    fn max_registers_per_block(&self) -> usize {
        self.max_registers_per_block
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

    fn new_flow(self: &Arc<Self>) -> Result<CudaFlow> {
        // Launches go through the context's default stream, so flows share
        // it; copies issued on a flow stay ordered with the launch.
        Ok(CudaFlow {
            stream: Arc::clone(&self.stream),
        })
    }

    fn malloc(
        self: &Arc<Self>,
        size: usize,
        host: *mut u8,
        read_only: bool,
        write_only: bool,
    ) -> Result<CudaMemory> {
        let slice = self.stream.alloc_zeros::<u8>(size.max(1)).map_err(|e| {
            Error::native(
                format!("CUDA allocation of {size} byte(s) failed: {e}"),
                crate::origin!(),
            )
        })?;
        Ok(CudaMemory {
            slice,
            stream: Arc::clone(&self.stream),
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
    ) -> Result<CudaChunkedMemory> {
        let total = chunk_size * chunks.len();
        let slice = self.stream.alloc_zeros::<u8>(total.max(1)).map_err(|e| {
            Error::native(
                format!("CUDA chunked allocation of {total} byte(s) failed: {e}"),
                crate::origin!(),
            )
        })?;
        Ok(CudaChunkedMemory {
            slice,
            stream: Arc::clone(&self.stream),
            hosts: chunks.to_vec(),
            chunk_size,
            _read_only: read_only,
            _write_only: write_only,
        })
    }

    fn prepare_kernel(self: &Arc<Self>, source: &str, kernel_name: &str) -> Result<CudaProgram> {
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
    ) -> Result<Vec<CudaProgram>> {
        let generator = CudaGenerator;
        let complete = format!(
            "{}{}",
            generator.std_functions(),
            generator.replace_macro_keywords(source)
        );
        log::debug!(
            "NVRTC compiling {} kernel(s) on device {}",
            kernel_names.len(),
            self.index
        );
        let ptx = compile_ptx_with_opts(&complete, CompileOptions::default()).map_err(|e| {
            Error::Compilation {
                message: format!("NVRTC rejected kernel(s) {kernel_names:?}"),
                log: e.to_string(),
            }
        })?;
        let module = self.context.load_module(ptx).map_err(|e| {
            Error::native(format!("PTX module load failed: {e}"), crate::origin!())
        })?;
        let module = Arc::new(module);
        Ok(kernel_names
            .iter()
            .map(|name| CudaProgram {
                entry_point: name.clone(),
                module: Arc::clone(&module),
                stream: Arc::clone(&self.stream),
                limits: self.limits(),
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct CudaProgram {
    entry_point: String,
    module: Arc<CudaModule>,
    stream: Arc<CudaStream>,
    limits: crate::driver::DeviceLimits,
}

impl KernelProgram<Cuda> for CudaProgram {
    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn instantiate(&self) -> Result<CudaKernel> {
        let function = self.module.load_function(&self.entry_point).map_err(|e| {
            Error::native(
                format!("function '{}' not found in module: {e}", self.entry_point),
                crate::origin!(),
            )
        })?;
        let registers = function
            .attribute(sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_NUM_REGS)
            .map(|regs| regs.max(0) as u32)
            .unwrap_or(0);
        Ok(CudaKernel {
            entry_point: self.entry_point.clone(),
            function,
            stream: Arc::clone(&self.stream),
            limits: self.limits,
            registers,
            args: Vec::new(),
            shared_bytes: 0,
            overrides: [0; 3],
        })
    }
}

pub struct CudaKernel {
    entry_point: String,
    function: CudaFunction,
    stream: Arc<CudaStream>,
    limits: crate::driver::DeviceLimits,
    registers: u32,
    /// Positional argument values; device pointers are stored as their
    /// 8-byte representation.
    args: Vec<Vec<u8>>,
    shared_bytes: usize,
    overrides: [usize; 3],
}

// The function handle is tied to a reference-counted module.
unsafe impl Send for CudaKernel {}

impl Kernel<Cuda> for CudaKernel {
    fn clear_args(&mut self) {
        self.args.clear();
        self.shared_bytes = 0;
    }

    fn set_value_arg(&mut self, bytes: &[u8]) -> Result<()> {
        self.args.push(bytes.to_vec());
        Ok(())
    }

    fn set_memory_arg(&mut self, memory: &CudaMemory) -> Result<()> {
        let ptr = *memory.slice.device_ptr() as u64;
        self.args.push(ptr.to_ne_bytes().to_vec());
        Ok(())
    }

    fn set_chunked_arg(&mut self, memory: &CudaChunkedMemory) -> Result<()> {
        let ptr = *memory.slice.device_ptr() as u64;
        self.args.push(ptr.to_ne_bytes().to_vec());
        Ok(())
    }

    fn set_shared_memory_bytes(&mut self, bytes: usize) {
        self.shared_bytes = bytes;
    }

    fn set_threads_per_block(&mut self, axis: usize, threads: usize) {
        self.overrides[axis] = threads;
    }

    fn registers_used(&self) -> u32 {
        self.registers
    }

    fn blocks_and_threads_for(&self, dims: &Dimensions) -> Result<Launch> {
        crate::driver::launch::blocks_and_threads(
            dims,
            &self.limits,
            self.registers_used(),
            &self.overrides,
        )
    }

    fn run_async(&mut self, dims: &Dimensions, _flow: &CudaFlow) -> Result<()> {
        let launch = self.blocks_and_threads_for(dims)?;
        let grid = launch.grid();
        let block = launch.block();
        let config = LaunchConfig {
            grid_dim: (grid[0] as u32, grid[1] as u32, grid[2] as u32),
            block_dim: (block[0] as u32, block[1] as u32, block[2] as u32),
            shared_mem_bytes: self.shared_bytes as u32,
        };
        log::debug!(
            "launching '{}' with grid={grid:?}, block={block:?}, {} arg(s)",
            self.entry_point,
            self.args.len()
        );
        let mut arg_ptrs: Vec<*mut c_void> = self
            .args
            .iter()
            .map(|arg| arg.as_ptr() as *mut c_void)
            .collect();
        unsafe {
            self.function
                .launch_raw(config, &mut arg_ptrs)
                .map_err(|e| {
                    Error::native(
                        format!("launch of '{}' failed: {e}", self.entry_point),
                        crate::origin!(),
                    )
                })?;
        }
        Ok(())
    }

    fn wait_async(&mut self) -> Result<()> {
        self.stream.synchronize().map_err(|e| {
            Error::native(
                format!("synchronization after '{}' failed: {e}", self.entry_point),
                crate::origin!(),
            )
        })
    }
}

pub struct CudaMemory {
    slice: CudaSlice<u8>,
    stream: Arc<CudaStream>,
    host: *mut u8,
    host_size: usize,
    read_only: bool,
    write_only: bool,
}

// The host pointer is owned by the caller, who keeps it valid for the
// lifetime of the owning parameter.
unsafe impl Send for CudaMemory {}

impl CudaMemory {
    fn host_slice(&self) -> Result<&[u8]> {
        if self.host.is_null() {
            return Err(Error::native("copy without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.slice.len());
        Ok(unsafe { std::slice::from_raw_parts(self.host, len) })
    }

    fn host_slice_mut(&mut self) -> Result<&mut [u8]> {
        if self.host.is_null() {
            return Err(Error::native("copy without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.slice.len());
        Ok(unsafe { std::slice::from_raw_parts_mut(self.host, len) })
    }
}

impl MemoryObject<Cuda> for CudaMemory {
    fn size(&self) -> usize {
        self.slice.len()
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
        // Transfers already go through stream-ordered copies.
        Ok(())
    }

    fn copy_in(&mut self) -> Result<()> {
        let flow = CudaFlow {
            stream: Arc::clone(&self.stream),
        };
        self.copy_in_async(&flow)?;
        self.wait_async()
    }

    fn copy_out(&mut self) -> Result<()> {
        let flow = CudaFlow {
            stream: Arc::clone(&self.stream),
        };
        self.copy_out_async(&flow)?;
        self.wait_async()
    }

    fn copy_in_async(&mut self, flow: &CudaFlow) -> Result<()> {
        let host = self.host_slice()?;
        let host: Vec<u8> = host.to_vec();
        let mut view = self.slice.slice_mut(0..host.len());
        flow.stream.memcpy_htod(&host, &mut view).map_err(|e| {
            Error::native(format!("host-to-device copy failed: {e}"), crate::origin!())
        })
    }

    fn copy_out_async(&mut self, flow: &CudaFlow) -> Result<()> {
        let len = self.host_size.min(self.slice.len());
        let mut staging = vec![0u8; len];
        {
            let view = self.slice.slice(0..len);
            flow.stream.memcpy_dtoh(&view, &mut staging).map_err(|e| {
                Error::native(format!("device-to-host copy failed: {e}"), crate::origin!())
            })?;
            flow.stream.synchronize().map_err(|e| {
                Error::native(format!("copy synchronization failed: {e}"), crate::origin!())
            })?;
        }
        let host = self.host_slice_mut()?;
        host.copy_from_slice(&staging);
        Ok(())
    }

    fn wait_async(&mut self) -> Result<()> {
        self.stream.synchronize().map_err(|e| {
            Error::native(format!("copy synchronization failed: {e}"), crate::origin!())
        })
    }
}

pub struct CudaChunkedMemory {
    slice: CudaSlice<u8>,
    stream: Arc<CudaStream>,
    hosts: Vec<*mut u8>,
    chunk_size: usize,
    _read_only: bool,
    _write_only: bool,
}

// Same contract as CudaMemory: chunk pointers outlive the parameter.
unsafe impl Send for CudaChunkedMemory {}

impl ChunkedMemoryObject<Cuda> for CudaChunkedMemory {
    fn chunk_count(&self) -> usize {
        self.hosts.len()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn copy_in(&mut self, chunks: usize) -> Result<()> {
        let stream = Arc::clone(&self.stream);
        let flow = CudaFlow { stream };
        self.copy_in_async(chunks, &flow)?;
        self.wait_async()
    }

    fn copy_out(&mut self, chunks: usize) -> Result<()> {
        let stream = Arc::clone(&self.stream);
        let flow = CudaFlow { stream };
        self.copy_out_async(chunks, &flow)?;
        self.wait_async()
    }

    fn copy_in_async(&mut self, chunks: usize, flow: &CudaFlow) -> Result<()> {
        for chunk in 0..chunks.min(self.hosts.len()) {
            let host = self.hosts[chunk];
            if host.is_null() {
                return Err(Error::native(
                    format!("chunk {chunk} has no host binding"),
                    crate::origin!(),
                ));
            }
            let src = unsafe { std::slice::from_raw_parts(host, self.chunk_size) }.to_vec();
            let offset = chunk * self.chunk_size;
            let mut view = self.slice.slice_mut(offset..offset + self.chunk_size);
            flow.stream.memcpy_htod(&src, &mut view).map_err(|e| {
                Error::native(
                    format!("host-to-device copy of chunk {chunk} failed: {e}"),
                    crate::origin!(),
                )
            })?;
        }
        Ok(())
    }

    fn copy_out_async(&mut self, chunks: usize, flow: &CudaFlow) -> Result<()> {
        for chunk in 0..chunks.min(self.hosts.len()) {
            let host = self.hosts[chunk];
            if host.is_null() {
                return Err(Error::native(
                    format!("chunk {chunk} has no host binding"),
                    crate::origin!(),
                ));
            }
            let offset = chunk * self.chunk_size;
            let mut staging = vec![0u8; self.chunk_size];
            let view = self.slice.slice(offset..offset + self.chunk_size);
            flow.stream.memcpy_dtoh(&view, &mut staging).map_err(|e| {
                Error::native(
                    format!("device-to-host copy of chunk {chunk} failed: {e}"),
                    crate::origin!(),
                )
            })?;
            flow.stream.synchronize().map_err(|e| {
                Error::native(format!("copy synchronization failed: {e}"), crate::origin!())
            })?;
            unsafe {
                std::ptr::copy_nonoverlapping(staging.as_ptr(), host, self.chunk_size);
            }
        }
        Ok(())
    }

    fn wait_async(&mut self) -> Result<()> {
        self.stream.synchronize().map_err(|e| {
            Error::native(format!("copy synchronization failed: {e}"), crate::origin!())
        })
    }
}

pub struct CudaFlow {
    stream: Arc<CudaStream>,
}

impl ExecutionFlow<Cuda> for CudaFlow {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.stream.synchronize().map_err(|e| {
            Error::native(format!("stream synchronization failed: {e}"), crate::origin!())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Direction;
    use crate::pattern::{Map, Pattern};

    fn runtime() -> Option<CudaRuntime> {
        let ctx = CudaRuntime::init().ok()?;
        if ctx.device_count() == 0 {
            println!("no CUDA device available, skipping test");
            return None;
        }
        Some(ctx)
    }

    #[test]
    fn device_limits_are_sane() {
        let Some(ctx) = runtime() else { return };
        let device = ctx.device(0).unwrap();
        assert!(device.max_threads_per_block() >= 32);
        assert!(device.warp_size() >= 16);
    }

    #[test]
    fn map_doubles_on_the_gpu() {
        let Some(ctx) = runtime() else { return };
        let mut data: Vec<f32> = (0..256).map(|v| v as f32).collect();
        let mut map = Map::<Cuda>::new(&ctx, "v[x] = v[x] * 2.0f;");
        map.set_parameter_pointer("v", data.as_mut_ptr(), data.len(), Direction::InOut)
            .unwrap();
        map.run(&crate::dims::Dimensions::new(data.len(), 0, 0))
            .unwrap();
        assert_eq!(data[0], 0.0);
        assert_eq!(data[255], 510.0);
    }
}
