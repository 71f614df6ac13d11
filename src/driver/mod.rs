//! Generic driver contract: the operations any backend must provide so the
//! pattern engine never special-cases a native API.
//!
//! Each role is its own trait, tied together by the [`Driver`] umbrella
//! through associated types, so a pattern monomorphizes over exactly one
//! backend. The split between [`KernelProgram`] (shared, immutable,
//! reference-counted) and [`Kernel`] (per-instance, mutable argument
//! binding) is deliberate: native argument-binding handles are not safe to
//! mutate from several threads even when the compiled program is, and the
//! type system enforces that clones instantiate their own binding.

pub mod codegen;
pub mod dummy;
pub mod launch;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::sync::Arc;

use crate::dims::Dimensions;
use crate::error::Result;
use codegen::KernelGenerator;
use launch::Launch;

/// Umbrella trait naming every role a backend implements.
pub trait Driver: Sized + 'static {
    const NAME: &'static str;

    type Context: Context<Self>;
    type Device: Device<Self>;
    type Program: KernelProgram<Self>;
    type Kernel: Kernel<Self>;
    type Memory: MemoryObject<Self>;
    type ChunkedMemory: ChunkedMemoryObject<Self>;
    type Flow: ExecutionFlow<Self>;
    type Generator: KernelGenerator + Default;
}

/// Entry point into a backend: device discovery. Constructed explicitly by
/// the application and handed to every pattern; there is no hidden global.
pub trait Context<D: Driver>: Clone + Send + Sync {
    fn init() -> Result<Self>;
    fn device_count(&self) -> usize;
    fn device(&self, index: usize) -> Result<Arc<D::Device>>;
}

/// Hardware limits consumed by the block/thread mapping.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    pub max_threads_per_block: usize,
    pub max_block_dims: [usize; 3],
    pub max_registers_per_block: usize,
}

/// One GPU: identity, limits, allocation and kernel preparation.
pub trait Device<D: Driver>: Send + Sync {
    fn name(&self) -> String;
    fn compute_units(&self) -> u32;
    fn warp_size(&self) -> u32;
    fn max_threads_per_block(&self) -> usize;
    fn max_block_dims(&self) -> [usize; 3];
    fn max_registers_per_block(&self) -> usize;
    fn global_memory_bytes(&self) -> usize;
    fn local_memory_bytes(&self) -> usize;
    fn clock_rate_mhz(&self) -> u32;
    fn is_integrated(&self) -> bool;

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            max_threads_per_block: self.max_threads_per_block(),
            max_block_dims: self.max_block_dims(),
            max_registers_per_block: self.max_registers_per_block(),
        }
    }

    fn new_flow(self: &Arc<Self>) -> Result<D::Flow>;

    /// Allocates a device buffer, optionally bound to a caller-owned host
    /// region for copies. Flags derive from the parameter direction so the
    /// backend can allocate with least privilege.
    fn malloc(
        self: &Arc<Self>,
        size: usize,
        host: *mut u8,
        read_only: bool,
        write_only: bool,
    ) -> Result<D::Memory>;

    /// Allocates one contiguous device buffer with one chunk-sized slot per
    /// batch instance, indexed from the kernel by the per-batch offset.
    fn malloc_chunked(
        self: &Arc<Self>,
        chunk_size: usize,
        chunks: &[*mut u8],
        read_only: bool,
        write_only: bool,
    ) -> Result<D::ChunkedMemory>;

    /// Compiles one kernel out of the given source. The backend prepends
    /// its builtin shims and resolves the macro vocabulary first.
    fn prepare_kernel(self: &Arc<Self>, source: &str, kernel_name: &str) -> Result<D::Program>;

    /// Compiles several kernels into a single native program, returning one
    /// handle per requested entry point.
    fn prepare_kernels(
        self: &Arc<Self>,
        source: &str,
        kernel_names: &[String],
    ) -> Result<Vec<D::Program>>;
}

/// A compiled program handle. Immutable and cheap to clone; every clone of
/// a pattern derives its own [`Kernel`] binding from the shared program.
pub trait KernelProgram<D: Driver>: Clone + Send + Sync {
    fn entry_point(&self) -> &str;
    fn instantiate(&self) -> Result<D::Kernel>;
}

/// Mutable launch state for one pattern instance: positional arguments,
/// shared-memory size, per-axis thread overrides.
pub trait Kernel<D: Driver>: Send {
    fn clear_args(&mut self);
    fn set_value_arg(&mut self, bytes: &[u8]) -> Result<()>;
    fn set_memory_arg(&mut self, memory: &D::Memory) -> Result<()>;
    fn set_chunked_arg(&mut self, memory: &D::ChunkedMemory) -> Result<()>;
    fn set_shared_memory_bytes(&mut self, bytes: usize);
    fn set_threads_per_block(&mut self, axis: usize, threads: usize);

    /// Registers the compiled kernel consumes, feeding the launch ceiling.
    /// Backends without the query report zero, which disables the ceiling.
    fn registers_used(&self) -> u32;

    fn blocks_and_threads_for(&self, dims: &Dimensions) -> Result<Launch>;

    fn run_async(&mut self, dims: &Dimensions, flow: &D::Flow) -> Result<()>;
    fn wait_async(&mut self) -> Result<()>;
}

/// A device buffer, optionally bound to a host region it copies from/to.
pub trait MemoryObject<D: Driver>: Send {
    fn size(&self) -> usize;
    fn is_read_only(&self) -> bool;
    fn is_write_only(&self) -> bool;

    /// Rebinds the host side without touching the device allocation.
    fn bind_to(&mut self, host: *mut u8, size: usize);

    /// Registers the host region for overlapped transfer. Best effort:
    /// backends without support return `Ok`.
    fn pin_host_memory(&mut self) -> Result<()>;

    fn copy_in(&mut self) -> Result<()>;
    fn copy_out(&mut self) -> Result<()>;
    fn copy_in_async(&mut self, flow: &D::Flow) -> Result<()>;
    fn copy_out_async(&mut self, flow: &D::Flow) -> Result<()>;

    /// Blocks until previously issued async copies on this object finish.
    fn wait_async(&mut self) -> Result<()>;
}

/// A batched allocation: chunk-sized slots laid out contiguously on the
/// device, each bound to its own host region.
pub trait ChunkedMemoryObject<D: Driver>: Send {
    fn chunk_count(&self) -> usize;
    fn chunk_size(&self) -> usize;

    /// Copies the first `chunks` chunks host to device.
    fn copy_in(&mut self, chunks: usize) -> Result<()>;
    /// Copies the first `chunks` chunks device to host.
    fn copy_out(&mut self, chunks: usize) -> Result<()>;
    fn copy_in_async(&mut self, chunks: usize, flow: &D::Flow) -> Result<()>;
    fn copy_out_async(&mut self, chunks: usize, flow: &D::Flow) -> Result<()>;
    fn wait_async(&mut self) -> Result<()>;
}

/// An ordered queue of asynchronous device operations (stream / command
/// queue). Copies for a launch are issued on the same flow as the launch
/// itself; cross-flow waits are how one backend deadlocks.
pub trait ExecutionFlow<D: Driver>: Send {
    /// Idempotent; flows are started lazily on first use.
    fn start(&mut self) -> Result<()>;
    fn synchronize(&mut self) -> Result<()>;
}
