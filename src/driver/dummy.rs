//! In-process backend with byte-vector device memory and a launch/compile
//! recorder. It never interprets kernel source; it exists to exercise the
//! pattern engine deterministically and to support dry runs without a GPU.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::dims::Dimensions;
use crate::driver::launch::{self, Launch};
use crate::driver::{
    codegen::{CudaGenerator, KernelGenerator},
    ChunkedMemoryObject, Context, Device, DeviceLimits, Driver, ExecutionFlow, Kernel,
    KernelProgram, MemoryObject,
};
use crate::error::{Error, Result};

/// The emulated driver.
pub struct Dummy;

impl Driver for Dummy {
    const NAME: &'static str = "dummy";

    type Context = DummyContext;
    type Device = DummyDevice;
    type Program = DummyProgram;
    type Kernel = DummyKernel;
    type Memory = DummyMemory;
    type ChunkedMemory = DummyChunkedMemory;
    type Flow = DummyFlow;
    type Generator = CudaGenerator;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
pub struct CompileRecord {
    pub device: usize,
    pub entry_points: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedArg {
    Value(Vec<u8>),
    Memory { size: usize },
    Chunked { chunks: usize, chunk_size: usize },
}

#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub entry_point: String,
    pub dims: Dimensions,
    pub grid: [usize; 3],
    pub block: [usize; 3],
    pub shared_bytes: usize,
    pub args: Vec<RecordedArg>,
}

/// Everything the emulated devices observed, shared across the context.
#[derive(Default)]
pub struct Recorder {
    compiles: Mutex<Vec<CompileRecord>>,
    launches: Mutex<Vec<LaunchRecord>>,
}

impl Recorder {
    pub fn compiles(&self) -> Vec<CompileRecord> {
        lock(&self.compiles).clone()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        lock(&self.launches).clone()
    }

    pub fn compile_count(&self) -> usize {
        lock(&self.compiles).len()
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.launches).len()
    }
}

#[derive(Clone)]
pub struct DummyContext {
    devices: Vec<Arc<DummyDevice>>,
    recorder: Arc<Recorder>,
}

impl DummyContext {
    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }
}

impl Context<Dummy> for DummyContext {
    fn init() -> Result<Self> {
        let recorder = Arc::new(Recorder::default());
        let devices = (0..2)
            .map(|index| {
                Arc::new(DummyDevice {
                    index,
                    recorder: Arc::clone(&recorder),
                })
            })
            .collect();
        Ok(Self { devices, recorder })
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, index: usize) -> Result<Arc<DummyDevice>> {
        self.devices.get(index).cloned().ok_or(Error::NoDevice {
            index,
            available: self.devices.len(),
        })
    }
}

pub struct DummyDevice {
    index: usize,
    recorder: Arc<Recorder>,
}

impl Device<Dummy> for DummyDevice {
    fn name(&self) -> String {
        format!("emulated device {}", self.index)
    }
    fn compute_units(&self) -> u32 {
        16
    }
    fn warp_size(&self) -> u32 {
        32
    }
    fn max_threads_per_block(&self) -> usize {
        1024
    }
    fn max_block_dims(&self) -> [usize; 3] {
        [1024, 1024, 64]
    }
    fn max_registers_per_block(&self) -> usize {
        65536
    }
    fn global_memory_bytes(&self) -> usize {
        1 << 30
    }
    fn local_memory_bytes(&self) -> usize {
        48 * 1024
    }
    fn clock_rate_mhz(&self) -> u32 {
        1000
    }
    fn is_integrated(&self) -> bool {
        false
    }

    fn new_flow(self: &Arc<Self>) -> Result<DummyFlow> {
        Ok(DummyFlow { started: false })
    }

    fn malloc(
        self: &Arc<Self>,
        size: usize,
        host: *mut u8,
        read_only: bool,
        write_only: bool,
    ) -> Result<DummyMemory> {
        Ok(DummyMemory {
            data: vec![0; size],
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
    ) -> Result<DummyChunkedMemory> {
        Ok(DummyChunkedMemory {
            data: chunks.iter().map(|_| vec![0; chunk_size]).collect(),
            hosts: chunks.to_vec(),
            chunk_size,
            _read_only: read_only,
            _write_only: write_only,
        })
    }

    fn prepare_kernel(self: &Arc<Self>, source: &str, kernel_name: &str) -> Result<DummyProgram> {
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
    ) -> Result<Vec<DummyProgram>> {
        let generator = CudaGenerator;
        let complete = format!(
            "{}{}",
            generator.std_functions(),
            generator.replace_macro_keywords(source)
        );
        lock(&self.recorder.compiles).push(CompileRecord {
            device: self.index,
            entry_points: kernel_names.to_vec(),
            source: complete.clone(),
        });
        log::debug!(
            "dummy device {} compiled {} kernel(s)",
            self.index,
            kernel_names.len()
        );
        Ok(kernel_names
            .iter()
            .map(|name| DummyProgram {
                entry_point: name.clone(),
                recorder: Arc::clone(&self.recorder),
                limits: self.limits(),
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct DummyProgram {
    entry_point: String,
    recorder: Arc<Recorder>,
    limits: DeviceLimits,
}

impl KernelProgram<Dummy> for DummyProgram {
    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn instantiate(&self) -> Result<DummyKernel> {
        Ok(DummyKernel {
            entry_point: self.entry_point.clone(),
            recorder: Arc::clone(&self.recorder),
            limits: self.limits,
            args: Vec::new(),
            shared_bytes: 0,
            overrides: [0; 3],
        })
    }
}

pub struct DummyKernel {
    entry_point: String,
    recorder: Arc<Recorder>,
    limits: DeviceLimits,
    args: Vec<RecordedArg>,
    shared_bytes: usize,
    overrides: [usize; 3],
}

impl Kernel<Dummy> for DummyKernel {
    fn clear_args(&mut self) {
        self.args.clear();
        self.shared_bytes = 0;
    }

    fn set_value_arg(&mut self, bytes: &[u8]) -> Result<()> {
        self.args.push(RecordedArg::Value(bytes.to_vec()));
        Ok(())
    }

    fn set_memory_arg(&mut self, memory: &DummyMemory) -> Result<()> {
        self.args.push(RecordedArg::Memory {
            size: memory.data.len(),
        });
        Ok(())
    }

    fn set_chunked_arg(&mut self, memory: &DummyChunkedMemory) -> Result<()> {
        self.args.push(RecordedArg::Chunked {
            chunks: memory.data.len(),
            chunk_size: memory.chunk_size,
        });
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
        launch::blocks_and_threads(dims, &self.limits, self.registers_used(), &self.overrides)
    }

    fn run_async(&mut self, dims: &Dimensions, _flow: &DummyFlow) -> Result<()> {
        let launch = self.blocks_and_threads_for(dims)?;
        log::debug!("dummy launch of '{}' for {}", self.entry_point, dims);
        lock(&self.recorder.launches).push(LaunchRecord {
            entry_point: self.entry_point.clone(),
            dims: *dims,
            grid: launch.grid(),
            block: launch.block(),
            shared_bytes: self.shared_bytes,
            args: self.args.clone(),
        });
        Ok(())
    }

    fn wait_async(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct DummyMemory {
    data: Vec<u8>,
    host: *mut u8,
    host_size: usize,
    read_only: bool,
    write_only: bool,
}

// The host pointer is owned by the caller, who keeps it valid for the
// lifetime of the owning parameter.
unsafe impl Send for DummyMemory {}

impl MemoryObject<Dummy> for DummyMemory {
    fn size(&self) -> usize {
        self.data.len()
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
        Ok(())
    }

    fn copy_in(&mut self) -> Result<()> {
        if self.host.is_null() {
            return Err(Error::native("copy-in without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.host, self.data.as_mut_ptr(), len);
        }
        Ok(())
    }

    fn copy_out(&mut self) -> Result<()> {
        if self.host.is_null() {
            return Err(Error::native("copy-out without a host binding", crate::origin!()));
        }
        let len = self.host_size.min(self.data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr(), self.host, len);
        }
        Ok(())
    }

    fn copy_in_async(&mut self, _flow: &DummyFlow) -> Result<()> {
        self.copy_in()
    }

    fn copy_out_async(&mut self, _flow: &DummyFlow) -> Result<()> {
        self.copy_out()
    }

    fn wait_async(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct DummyChunkedMemory {
    data: Vec<Vec<u8>>,
    hosts: Vec<*mut u8>,
    chunk_size: usize,
    _read_only: bool,
    _write_only: bool,
}

// Same contract as DummyMemory: chunk pointers outlive the parameter.
unsafe impl Send for DummyChunkedMemory {}

impl DummyChunkedMemory {
    fn copy(&mut self, into_device: bool, chunks: usize) -> Result<()> {
        for chunk in 0..chunks.min(self.data.len()) {
            let host = self.hosts[chunk];
            if host.is_null() {
                return Err(Error::native(
                    format!("chunk {chunk} has no host binding"),
                    crate::origin!(),
                ));
            }
            unsafe {
                if into_device {
                    std::ptr::copy_nonoverlapping(
                        host,
                        self.data[chunk].as_mut_ptr(),
                        self.chunk_size,
                    );
                } else {
                    std::ptr::copy_nonoverlapping(
                        self.data[chunk].as_ptr(),
                        host,
                        self.chunk_size,
                    );
                }
            }
        }
        Ok(())
    }
}

impl ChunkedMemoryObject<Dummy> for DummyChunkedMemory {
    fn chunk_count(&self) -> usize {
        self.data.len()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn copy_in(&mut self, chunks: usize) -> Result<()> {
        self.copy(true, chunks)
    }

    fn copy_out(&mut self, chunks: usize) -> Result<()> {
        self.copy(false, chunks)
    }

    fn copy_in_async(&mut self, chunks: usize, _flow: &DummyFlow) -> Result<()> {
        self.copy(true, chunks)
    }

    fn copy_out_async(&mut self, chunks: usize, _flow: &DummyFlow) -> Result<()> {
        self.copy(false, chunks)
    }

    fn wait_async(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct DummyFlow {
    started: bool,
}

impl ExecutionFlow<Dummy> for DummyFlow {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trips_through_the_device() {
        let ctx = DummyContext::init().unwrap();
        let device = ctx.device(0).unwrap();
        let mut data = [1u8, 2, 3, 4];
        let mut mem = device
            .malloc(4, data.as_mut_ptr(), false, false)
            .unwrap();
        mem.copy_in().unwrap();
        data = [0; 4];
        mem.copy_out().unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    fn compiles_and_launches_are_recorded() {
        let ctx = DummyContext::init().unwrap();
        let device = ctx.device(0).unwrap();
        let program = device.prepare_kernel("__global__ void k() {}", "k").unwrap();
        let mut kernel = program.instantiate().unwrap();
        let flow = device.new_flow().unwrap();
        kernel
            .set_value_arg(&20u64.to_ne_bytes())
            .unwrap();
        kernel.run_async(&Dimensions::new(20, 0, 0), &flow).unwrap();

        let recorder = ctx.recorder();
        assert_eq!(recorder.compile_count(), 1);
        let launches = recorder.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].grid, [1, 1, 1]);
        assert_eq!(launches[0].block, [20, 1, 1]);
        assert_eq!(
            launches[0].args[0],
            RecordedArg::Value(20u64.to_ne_bytes().to_vec())
        );
    }

    #[test]
    fn std_functions_are_prepended_to_programs() {
        let ctx = DummyContext::init().unwrap();
        let device = ctx.device(0).unwrap();
        device.prepare_kernel("void k() {}", "k").unwrap();
        let compiles = ctx.recorder().compiles();
        assert!(compiles[0].source.contains("motif_get_global_id"));
    }
}
