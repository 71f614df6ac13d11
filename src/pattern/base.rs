//! The pattern engine: parameter registry, kernel-source assembly, compile
//! cache with staleness tracking, memory orchestration and cloning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::dims::{Dimensions, SUPPORTED_DIMS};
use crate::driver::codegen::{KernelSourceBuilder, ParamDecl, SharedDecl};
use crate::driver::{
    ChunkedMemoryObject, Context, Device, Driver, ExecutionFlow, Kernel, KernelProgram,
    MemoryObject,
};
use crate::error::{Error, Result};
use crate::param::{
    Direction, DeviceBinding, HostBinding, KernelArg, ParamKind, Parameter, TypeDesc,
};

static KERNEL_NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);
static SHARED_NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A compiled kernel: the shared program handle, the dimensions it was
/// compiled for, and this instance's private argument binding.
pub struct CompiledKernel<D: Driver> {
    pub(crate) program: Arc<D::Program>,
    pub(crate) dims: Dimensions,
    pub(crate) kernel: D::Kernel,
}

/// State shared by every pattern: registry, cache, device and flow.
///
/// Cloned patterns share the parameter entries (reference-counted) and the
/// compiled program, but each clone owns its argument binding and its
/// execution flow.
pub struct PatternCore<D: Driver> {
    ctx: D::Context,
    gpu_index: usize,
    device: Option<Arc<D::Device>>,
    flow: Option<D::Flow>,
    kernel_name: Option<String>,
    user_kernel: String,
    extra_kernel_code: String,
    std_var_names: [String; SUPPORTED_DIMS],
    params: FxHashMap<String, Arc<Mutex<Parameter<D>>>>,
    params_order: Vec<String>,
    batch_size: usize,
    threads_override: [usize; SUPPORTED_DIMS],
    pub(crate) use_shared_memory: bool,
    pub(crate) shared_param: Option<Arc<Mutex<Parameter<D>>>>,
    compiled: Option<CompiledKernel<D>>,
    stale: bool,
}

impl<D: Driver> PatternCore<D> {
    pub fn new(ctx: &D::Context, user_kernel: &str) -> Self {
        Self {
            ctx: ctx.clone(),
            gpu_index: 0,
            device: None,
            flow: None,
            kernel_name: None,
            user_kernel: user_kernel.to_string(),
            extra_kernel_code: String::new(),
            std_var_names: ["x".into(), "y".into(), "z".into()],
            params: FxHashMap::default(),
            params_order: Vec::new(),
            batch_size: 0,
            threads_override: [0; SUPPORTED_DIMS],
            use_shared_memory: false,
            shared_param: None,
            compiled: None,
            stale: false,
        }
    }

    pub fn is_batched(&self) -> bool {
        self.batch_size > 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn user_kernel(&self) -> &str {
        &self.user_kernel
    }

    pub fn std_var_names(&self) -> &[String; SUPPORTED_DIMS] {
        &self.std_var_names
    }

    /// Selects the device the pattern runs on. Switching devices discards
    /// the cached kernel.
    pub fn set_gpu_index(&mut self, index: usize) -> &mut Self {
        if self.gpu_index != index {
            self.gpu_index = index;
            self.device = None;
            self.flow = None;
            self.stale = true;
        }
        self
    }

    pub fn gpu_index(&self) -> usize {
        self.gpu_index
    }

    /// Toggling batching on or off changes the kernel signature; changing
    /// a non-zero batch size does not.
    pub fn set_batch_size(&mut self, batch_size: usize) -> &mut Self {
        if (self.batch_size > 0) != (batch_size > 0) {
            self.stale = true;
        }
        self.batch_size = batch_size;
        self
    }

    pub fn set_std_var_names(&mut self, names: [String; SUPPORTED_DIMS]) -> &mut Self {
        self.std_var_names = names;
        self.stale = true;
        self
    }

    pub fn add_extra_kernel_code(&mut self, code: &str) -> &mut Self {
        self.extra_kernel_code.push_str(code);
        self.stale = true;
        self
    }

    pub fn set_kernel_name(&mut self, name: &str) -> &mut Self {
        self.kernel_name = Some(name.to_string());
        self
    }

    /// The kernel's entry-point name, auto-generated on first use.
    pub fn kernel_name(&mut self) -> String {
        if self.kernel_name.is_none() {
            let n = KERNEL_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
            self.kernel_name = Some(format!("motif_kernel_{n}"));
        }
        self.kernel_name.clone().unwrap_or_default()
    }

    pub fn set_threads_per_block(&mut self, axis: usize, threads: usize) -> &mut Self {
        self.threads_override[axis] = threads;
        self
    }

    // ---- parameter registry ----

    /// By-value scalar parameter.
    pub fn set_parameter_value<T: KernelArg>(&mut self, name: &str, value: T) -> &mut Self {
        self.register(Parameter::value(name, value));
        self
    }

    /// Device-buffer parameter over a caller-owned host region.
    pub fn set_parameter_pointer<T: KernelArg>(
        &mut self,
        name: &str,
        ptr: *mut T,
        count: usize,
        direction: Direction,
    ) -> Result<&mut Self> {
        self.register(Parameter::pointer(name, ptr, count, direction)?);
        Ok(self)
    }

    /// Parameter backed by an existing device memory object (PRESENT).
    pub fn set_parameter_memory<T: KernelArg>(
        &mut self,
        name: &str,
        memory: Arc<Mutex<D::Memory>>,
        size: usize,
    ) -> &mut Self {
        self.register(Parameter::from_memory::<T>(name, memory, size));
        self
    }

    /// Declares a parameter before its value exists, so the kernel can be
    /// compiled ahead of the data.
    pub fn set_parameter_placeholder<T: KernelArg>(
        &mut self,
        name: &str,
        kind: ParamKind,
        direction: Direction,
        batched: bool,
    ) -> &mut Self {
        self.register(Parameter::placeholder::<T>(name, kind, direction, batched));
        self
    }

    /// Batched pointer parameter: one chunk per batch instance.
    pub fn set_batched_pointer<T: KernelArg>(
        &mut self,
        name: &str,
        chunks: &[*mut T],
        count_per_chunk: usize,
        direction: Direction,
    ) -> Result<&mut Self> {
        self.register(Parameter::batched_pointer(
            name,
            chunks,
            count_per_chunk,
            direction,
        )?);
        Ok(self)
    }

    /// Batched value parameter: one scalar per batch instance.
    pub fn set_batched_value<T: KernelArg>(&mut self, name: &str, values: *mut T) -> &mut Self {
        self.register(Parameter::batched_value(name, values));
        self
    }

    pub fn param(&self, name: &str) -> Option<Arc<Mutex<Parameter<D>>>> {
        self.params.get(name).cloned()
    }

    pub(crate) fn param_order(&self) -> &[String] {
        &self.params_order
    }

    pub(crate) fn register(&mut self, mut new: Parameter<D>) {
        if let Some(existing) = self.params.get(&new.name) {
            let mut p = lock(existing);
            if p.kind == new.kind && p.ty == new.ty && p.batched == new.batched {
                // Same shape: rebind in place and keep the compiled kernel.
                p.direction = new.direction;
                if p.size != new.size {
                    p.size = new.size;
                    p.device = DeviceBinding::None;
                }
                p.host = std::mem::replace(&mut new.host, HostBinding::None);
                if matches!(new.device, DeviceBinding::Shared(_)) {
                    p.device = new.device;
                }
                p.set_complete(true);
                let Parameter { device, host, size, .. } = &mut *p;
                if let (DeviceBinding::Memory(mem), HostBinding::Pointer(ptr)) = (device, &*host) {
                    mem.bind_to(*ptr, *size);
                }
                return;
            }
        }
        // New parameter, or an existing one whose shape changed: the kernel
        // signature is different now.
        let name = new.name.clone();
        self.params.insert(name.clone(), Arc::new(Mutex::new(new)));
        if !self.params_order.contains(&name) {
            self.params_order.push(name);
        }
        self.stale = true;
    }

    /// Removes a parameter from the registry and the kernel signature.
    pub fn remove_parameter(&mut self, name: &str) -> &mut Self {
        if self.params.remove(name).is_some() {
            self.params_order.retain(|n| n != name);
            self.stale = true;
        }
        self
    }

    // ---- device and flow ----

    pub(crate) fn device(&mut self) -> Result<Arc<D::Device>> {
        if self.device.is_none() {
            let available = self.ctx.device_count();
            if available == 0 {
                return Err(Error::NoDevice {
                    index: self.gpu_index,
                    available,
                });
            }
            self.device = Some(self.ctx.device(self.gpu_index)?);
        }
        match self.device.as_ref() {
            Some(device) => Ok(Arc::clone(device)),
            None => Err(Error::NoDevice {
                index: self.gpu_index,
                available: 0,
            }),
        }
    }

    pub(crate) fn ensure_flow(&mut self) -> Result<()> {
        if self.flow.is_none() {
            let device = self.device()?;
            let mut flow = device.new_flow()?;
            flow.start()?;
            self.flow = Some(flow);
        }
        Ok(())
    }

    fn flow(&self) -> Result<&D::Flow> {
        match self.flow.as_ref() {
            Some(flow) => Ok(flow),
            None => Err(Error::native("execution flow not started", crate::origin!())),
        }
    }

    // ---- compile cache ----

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub(crate) fn compiled_dims(&self) -> Option<Dimensions> {
        self.compiled.as_ref().map(|ck| ck.dims)
    }

    pub(crate) fn is_compiled_for(&self, dims: &Dimensions) -> bool {
        match &self.compiled {
            Some(ck) => !self.stale && ck.dims == *dims,
            None => false,
        }
    }

    pub(crate) fn install(&mut self, program: Arc<D::Program>, dims: Dimensions) -> Result<()> {
        let kernel = program.instantiate()?;
        self.compiled = Some(CompiledKernel {
            program,
            dims,
            kernel,
        });
        self.stale = false;
        Ok(())
    }

    pub(crate) fn take_compiled(&mut self) -> Result<CompiledKernel<D>> {
        self.compiled
            .take()
            .ok_or_else(|| Error::native("pattern has no compiled kernel", crate::origin!()))
    }

    pub(crate) fn restore_compiled(&mut self, compiled: CompiledKernel<D>) {
        self.compiled = Some(compiled);
    }

    // ---- source assembly ----

    fn param_decls(&self) -> Vec<ParamDecl> {
        self.params_order
            .iter()
            .filter_map(|name| self.params.get(name))
            .filter_map(|param| {
                let p = lock(param);
                if p.direction == Direction::None {
                    return None;
                }
                let mut declared = p.ty.full_name();
                if p.batched && p.kind == ParamKind::Value {
                    declared.push('*');
                }
                Some(ParamDecl {
                    name: p.name.clone(),
                    kernel_name: p.kernel_parameter_name(),
                    declared_type: declared,
                    rebind_type: p.ty.full_name(),
                    kind: p.kind,
                    batched: p.batched,
                    is_const_in: p.direction == Direction::In && p.ty.is_const,
                })
            })
            .collect()
    }

    fn shared_decl(&self) -> Option<SharedDecl> {
        self.shared_param.as_ref().map(|param| {
            let p = lock(param);
            SharedDecl {
                name: p.name.clone(),
                scalar_type: p.ty.scalar_name().to_string(),
            }
        })
    }

    /// Assembles the complete kernel source around the pattern's body.
    pub(crate) fn generate_source(&mut self, dims: &Dimensions, body: &str) -> Result<String> {
        dims.validate()?;
        let name = self.kernel_name();
        let generator = D::Generator::default();
        let mut builder = KernelSourceBuilder::new(&generator, &name, *dims)
            .with_std_var_names(self.std_var_names.clone())
            .with_batched(self.is_batched())
            .with_extra_code(&self.extra_kernel_code)
            .with_body(body);
        for decl in self.param_decls() {
            builder = builder.with_param(decl);
        }
        if self.use_shared_memory {
            if let Some(shared) = self.shared_decl() {
                builder = builder.with_shared(shared);
            }
        }
        Ok(builder.build())
    }

    /// Lazily creates the shared-memory placeholder used by patterns that
    /// stage data per block.
    pub(crate) fn shared_memory_param(
        &mut self,
        scalar: &TypeDesc,
    ) -> Arc<Mutex<Parameter<D>>> {
        let param = self.shared_param.get_or_insert_with(|| {
            let n = SHARED_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
            let mut param: Parameter<D> = Parameter::placeholder::<u8>(
                format!("motif_shared_{n}"),
                ParamKind::Pointer,
                Direction::None,
                false,
            );
            param.ty = TypeDesc::pointer(scalar.scalar_name());
            param.size = 0;
            Arc::new(Mutex::new(param))
        });
        Arc::clone(param)
    }

    // ---- memory orchestration ----

    /// Allocates device memory for every complete parameter that needs it,
    /// reallocating only what changed since the previous run.
    pub(crate) fn malloc_params(&mut self) -> Result<()> {
        let device = self.device()?;
        let batch = self.batch_size.max(1);
        for name in &self.params_order {
            let param = match self.params.get(name) {
                Some(param) => param,
                None => return Err(Error::UnknownParameter(name.clone())),
            };
            let mut p = lock(param);
            if p.direction == Direction::None {
                continue;
            }
            if !p.is_complete() {
                return Err(Error::IncompleteParameter(p.name.clone()));
            }
            if p.kind == ParamKind::Value && !p.batched {
                continue;
            }
            let read_only = p.direction == Direction::In;
            let write_only = p.direction == Direction::Out;
            let is_out = p.direction.is_out();
            let wanted = p.allocation_size(batch);
            let Parameter { device: binding, host, name, .. } = &mut *p;
            // PRESENT parameters: the caller owns the allocation.
            if matches!(binding, DeviceBinding::Shared(_)) {
                continue;
            }
            match &*host {
                HostBinding::Pointers(ptrs) => {
                    if batch > ptrs.len() {
                        return Err(Error::native(
                            format!(
                                "batch size {batch} exceeds the {} chunk(s) of parameter '{name}'",
                                ptrs.len()
                            ),
                            crate::origin!(),
                        ));
                    }
                    if !matches!(binding, DeviceBinding::Chunked(_)) {
                        *binding = DeviceBinding::Chunked(device.malloc_chunked(
                            wanted,
                            ptrs,
                            read_only,
                            write_only,
                        )?);
                    }
                }
                host_binding => {
                    let host_ptr = match host_binding {
                        HostBinding::Pointer(ptr) => *ptr,
                        HostBinding::Owned(buf) => buf.as_ptr() as *mut u8,
                        _ => std::ptr::null_mut(),
                    };
                    if let DeviceBinding::Memory(mem) = binding {
                        if mem.size() == wanted {
                            mem.bind_to(host_ptr, wanted);
                            continue;
                        }
                    }
                    let mut mem = device.malloc(wanted, host_ptr, read_only, write_only)?;
                    if is_out && !host_ptr.is_null() {
                        // Opportunistic: backends without support, or
                        // partially-registered regions, skip pinning.
                        if let Err(err) = mem.pin_host_memory() {
                            log::debug!("host pinning skipped for '{name}': {err}");
                        }
                    }
                    *binding = DeviceBinding::Memory(mem);
                }
            }
        }
        Ok(())
    }

    /// Copies IN/INOUT parameters host to device, asynchronously on the
    /// same flow the kernel will run on.
    pub(crate) fn copy_params_in(&mut self) -> Result<()> {
        self.ensure_flow()?;
        let batch = self.batch_size.max(1);
        let flow = self.flow()?;
        for name in &self.params_order {
            let param = match self.params.get(name) {
                Some(param) => param,
                None => return Err(Error::UnknownParameter(name.clone())),
            };
            let mut p = lock(param);
            if !p.direction.is_in() {
                continue;
            }
            match &mut p.device {
                DeviceBinding::Memory(mem) => mem.copy_in_async(flow)?,
                DeviceBinding::Chunked(chunked) => {
                    chunked.copy_in_async(batch, flow)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Copies OUT/INOUT parameters device to host, synchronously, after the
    /// kernel finished.
    pub(crate) fn copy_params_out(&mut self) -> Result<()> {
        let batch = self.batch_size.max(1);
        for name in &self.params_order {
            let param = match self.params.get(name) {
                Some(param) => param,
                None => return Err(Error::UnknownParameter(name.clone())),
            };
            let mut p = lock(param);
            if !p.direction.is_out() {
                continue;
            }
            match &mut p.device {
                DeviceBinding::Memory(mem) => mem.copy_out()?,
                DeviceBinding::Chunked(chunked) => chunked.copy_out(batch)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Binds the positional dimension arguments: per-axis max (and min when
    /// non-zero and unbatched), then the batch size when batched.
    pub(crate) fn set_dims_args(&self, kernel: &mut D::Kernel, dims: &Dimensions) -> Result<()> {
        for d in 0..SUPPORTED_DIMS {
            if !dims.is(d) {
                continue;
            }
            kernel.set_value_arg(&(dims[d].max as u64).to_ne_bytes())?;
            if dims[d].min != 0 && !self.is_batched() {
                kernel.set_value_arg(&(dims[d].min as u64).to_ne_bytes())?;
            }
        }
        if self.is_batched() {
            kernel.set_value_arg(&(self.batch_size as u32).to_ne_bytes())?;
        }
        Ok(())
    }

    /// Binds one registered parameter as the next positional argument.
    pub(crate) fn set_param_arg(&self, kernel: &mut D::Kernel, name: &str) -> Result<()> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        let mut p = lock(param);
        if p.direction == Direction::None {
            return Ok(());
        }
        if !p.is_complete() {
            return Err(Error::IncompleteParameter(p.name.clone()));
        }
        let kind = p.kind;
        let batched = p.batched;
        match (kind, batched) {
            (ParamKind::Value, false) => match &p.host {
                HostBinding::Value(bytes) => kernel.set_value_arg(bytes),
                _ => Err(Error::IncompleteParameter(p.name.clone())),
            },
            _ => match &mut p.device {
                DeviceBinding::Memory(mem) => kernel.set_memory_arg(mem),
                DeviceBinding::Chunked(chunked) => kernel.set_chunked_arg(chunked),
                DeviceBinding::Shared(shared) => kernel.set_memory_arg(&lock(shared)),
                DeviceBinding::None => Err(Error::PresentWithoutMemory(p.name.clone())),
            },
        }
    }

    /// Binds every registered parameter in registration order.
    pub(crate) fn set_param_args(&self, kernel: &mut D::Kernel) -> Result<()> {
        for name in &self.params_order {
            self.set_param_arg(kernel, name)?;
        }
        Ok(())
    }

    pub(crate) fn apply_thread_overrides(&self, kernel: &mut D::Kernel) {
        for d in 0..SUPPORTED_DIMS {
            if self.threads_override[d] > 0 {
                kernel.set_threads_per_block(d, self.threads_override[d]);
            }
        }
    }

    pub(crate) fn launch(&self, kernel: &mut D::Kernel, dims: &Dimensions) -> Result<()> {
        let flow = self.flow()?;
        log::debug!("launching kernel for {dims} on {}", D::NAME);
        kernel.run_async(dims, flow)
    }

    /// Shares the registry and, when still valid, the compiled program;
    /// the clone gets its own argument binding and its own flow.
    pub(crate) fn clone_core(&self) -> Result<Self> {
        let compiled = match &self.compiled {
            Some(ck) if !self.stale => Some(CompiledKernel {
                program: Arc::clone(&ck.program),
                dims: ck.dims,
                kernel: ck.program.instantiate()?,
            }),
            _ => None,
        };
        Ok(Self {
            ctx: self.ctx.clone(),
            gpu_index: self.gpu_index,
            device: self.device.clone(),
            flow: None,
            kernel_name: self.kernel_name.clone(),
            user_kernel: self.user_kernel.clone(),
            extra_kernel_code: self.extra_kernel_code.clone(),
            std_var_names: self.std_var_names.clone(),
            params: self.params.clone(),
            params_order: self.params_order.clone(),
            batch_size: self.batch_size,
            threads_override: self.threads_override,
            use_shared_memory: self.use_shared_memory,
            shared_param: self.shared_param.clone(),
            compiled,
            stale: self.stale,
        })
    }
}

/// The compile/run contract every pattern implements. Default methods hold
/// the orchestration; patterns override the body generation and the hooks.
pub trait Pattern<D: Driver>: Sized {
    const PATTERN_NAME: &'static str;

    fn core(&self) -> &PatternCore<D>;
    fn core_mut(&mut self) -> &mut PatternCore<D>;

    /// The pattern-specific code inside the bounds guard.
    fn kernel_body(&mut self, dims: &Dimensions) -> Result<String>;

    /// Runs before source generation; patterns register derived parameters
    /// here.
    fn before_generating_source(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs after compilation, before device allocation; patterns size
    /// derived buffers here.
    fn before_allocating_memory(
        &mut self,
        _dims: &Dimensions,
        _kernel: &mut D::Kernel,
    ) -> Result<()> {
        Ok(())
    }

    /// Dynamic shared-memory bytes for a launch; zero disables it.
    fn shared_memory_bytes(&mut self, _dims: &Dimensions, _kernel: &D::Kernel) -> Result<usize> {
        Ok(0)
    }

    fn is_compiled_for(&self, dims: &Dimensions) -> bool {
        self.core().is_compiled_for(dims)
    }

    /// Generates this pattern's full kernel source without compiling it.
    fn prepare_source(&mut self, dims: &Dimensions) -> Result<(String, String)> {
        dims.validate()?;
        self.before_generating_source()?;
        let body = self.kernel_body(dims)?;
        let core = self.core_mut();
        let name = core.kernel_name();
        let source = core.generate_source(dims, &body)?;
        Ok((name, source))
    }

    /// No-op when a valid kernel for identical dimensions is cached.
    fn compile(&mut self, dims: &Dimensions) -> Result<()> {
        if self.is_compiled_for(dims) {
            return Ok(());
        }
        let (name, source) = self.prepare_source(dims)?;
        let device = self.core_mut().device()?;
        log::debug!("compiling kernel '{name}' for {dims}");
        let program = device.prepare_kernel(&source, &name)?;
        self.core_mut().install(Arc::new(program), *dims)
    }

    /// Compiles if needed, orchestrates memory, launches and waits.
    fn run(&mut self, dims: &Dimensions) -> Result<()> {
        let batch = self.core().batch_size();
        let dims_to_run = if batch > 0 { *dims * batch } else { *dims };
        self.compile(dims)?;
        let mut ck = self.core_mut().take_compiled()?;
        let result = self.run_with(&mut ck, dims, &dims_to_run);
        self.core_mut().restore_compiled(ck);
        result
    }

    /// Re-runs with the dimensions of the previous compile, without
    /// restating them.
    fn run_compiled(&mut self) -> Result<()> {
        let dims = self
            .core()
            .compiled_dims()
            .ok_or_else(|| Error::native("pattern has no compiled kernel", crate::origin!()))?;
        self.run(&dims)
    }

    #[doc(hidden)]
    fn run_with(
        &mut self,
        ck: &mut CompiledKernel<D>,
        dims: &Dimensions,
        dims_to_run: &Dimensions,
    ) -> Result<()> {
        ck.kernel.clear_args();
        self.before_allocating_memory(dims_to_run, &mut ck.kernel)?;
        self.core_mut().malloc_params()?;
        self.core_mut().copy_params_in()?;
        let shared = self.shared_memory_bytes(dims_to_run, &ck.kernel)?;
        if shared > 0 {
            ck.kernel.set_shared_memory_bytes(shared);
        }
        let core = self.core();
        core.apply_thread_overrides(&mut ck.kernel);
        // The per-instance extent, not the batch-scaled one: generated code
        // splits the global id with it.
        core.set_dims_args(&mut ck.kernel, dims)?;
        core.set_param_args(&mut ck.kernel)?;
        core.launch(&mut ck.kernel, dims_to_run)?;
        ck.kernel.wait_async()?;
        self.core_mut().copy_params_out()
    }
}
