//! Kernel source generation: the per-dialect lexical primitives and the
//! structured builder that assembles a complete kernel out of them.
//!
//! The builder keeps every fragment (parameter list, init block, standard
//! variables, batched rebinding, bounds guard) separately assemblable so
//! each can be exercised on its own.

use crate::dims::{Dimensions, SUPPORTED_DIMS};
use crate::param::ParamKind;

/// Keywords user kernels may embed; each backend defines them to its
/// dialect's spelling before compilation.
pub const MACRO_KERNEL: &str = "MOTIF_DEVICE_KERNEL";
pub const MACRO_GLOBAL_MEMORY: &str = "MOTIF_DEVICE_GLOBAL_MEMORY";
pub const MACRO_SHARED_MEMORY: &str = "MOTIF_DEVICE_SHARED_MEMORY";
pub const MACRO_CONSTANT: &str = "MOTIF_DEVICE_CONSTANT";
pub const MACRO_FUNCTION: &str = "MOTIF_DEVICE_FUNCTION";
pub const MACRO_BEGIN: &str = "MOTIF_DEVICE_MACRO_BEGIN";
pub const MACRO_END: &str = "MOTIF_DEVICE_MACRO_END";

/// Backend-specific lexical primitives consumed during source assembly.
pub trait KernelGenerator {
    fn kernel_prefix(&self) -> &'static str;
    fn global_memory_prefix(&self) -> &'static str;
    fn shared_memory_prefix(&self) -> &'static str;
    fn constant_prefix(&self) -> &'static str;
    fn device_function_prefix(&self) -> &'static str;

    /// Builtin shims (`motif_get_global_id` and friends) prepended to every
    /// compiled program.
    fn std_functions(&self) -> String;

    /// Whether the per-block shared buffer is declared as a trailing kernel
    /// parameter (OpenCL) instead of inside the body (CUDA).
    fn shared_memory_as_parameter(&self) -> bool;

    /// Resolves the macro-definition pair to the native preprocessor.
    fn replace_macro_keywords(&self, source: &str) -> String {
        source
            .replace(MACRO_BEGIN, "#define")
            .replace(MACRO_END, "\n")
    }

    /// The keyword vocabulary as (macro, replacement) pairs, turned into
    /// compiler defines by the backend.
    fn macro_vocabulary(&self) -> [(&'static str, &'static str); 5] {
        [
            (MACRO_KERNEL, self.kernel_prefix()),
            (MACRO_GLOBAL_MEMORY, self.global_memory_prefix()),
            (MACRO_SHARED_MEMORY, self.shared_memory_prefix()),
            (MACRO_CONSTANT, self.constant_prefix()),
            (MACRO_FUNCTION, self.device_function_prefix()),
        ]
    }
}

/// CUDA C dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaGenerator;

impl KernelGenerator for CudaGenerator {
    fn kernel_prefix(&self) -> &'static str {
        "extern \"C\" __global__"
    }
    fn global_memory_prefix(&self) -> &'static str {
        ""
    }
    fn shared_memory_prefix(&self) -> &'static str {
        "extern __shared__"
    }
    fn constant_prefix(&self) -> &'static str {
        "const"
    }
    fn device_function_prefix(&self) -> &'static str {
        "__device__"
    }
    fn shared_memory_as_parameter(&self) -> bool {
        false
    }

    fn std_functions(&self) -> String {
        let mut gid = String::from("__device__ size_t motif_get_global_id(unsigned int dimension) { \n");
        let mut tid = String::from("__device__ size_t motif_get_thread_id(unsigned int dimension) { \n");
        let mut bid = String::from("__device__ size_t motif_get_block_id(unsigned int dimension) { \n");
        let mut bsize = String::from("__device__ size_t motif_get_block_size(unsigned int dimension) { \n");
        let mut gsize = String::from("__device__ size_t motif_get_grid_size(unsigned int dimension) { \n");
        for d in 0..SUPPORTED_DIMS {
            let n = Dimensions::axis_name(d);
            gid.push_str(&format!(
                "   if (dimension == {d}) return blockIdx.{n} * blockDim.{n} + threadIdx.{n}; \n"
            ));
            tid.push_str(&format!("   if (dimension == {d}) return threadIdx.{n}; \n"));
            bid.push_str(&format!("   if (dimension == {d}) return blockIdx.{n}; \n"));
            bsize.push_str(&format!("   if (dimension == {d}) return blockDim.{n}; \n"));
            gsize.push_str(&format!("   if (dimension == {d}) return gridDim.{n}; \n"));
        }
        for s in [&mut gid, &mut tid, &mut bid, &mut bsize, &mut gsize] {
            s.push_str("   return 0; } \n");
        }
        format!(
            "{gid}{tid}{bid}{bsize}{gsize}\
             extern \"C\" __device__ void motif_synchronize_local_threads() {{ __syncthreads(); }} \n\
             __device__ int motif_atomic_add_int(int* valq, int delta) {{ return atomicAdd(valq, delta); }} \n\
             __device__ double motif_atomic_add_double(double* valq, double delta) {{ return atomicAdd(valq, delta); }} \n"
        )
    }
}

/// OpenCL C dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenClGenerator;

impl KernelGenerator for OpenClGenerator {
    fn kernel_prefix(&self) -> &'static str {
        "__kernel"
    }
    fn global_memory_prefix(&self) -> &'static str {
        "__global"
    }
    fn shared_memory_prefix(&self) -> &'static str {
        "__local"
    }
    fn constant_prefix(&self) -> &'static str {
        "__constant"
    }
    fn device_function_prefix(&self) -> &'static str {
        ""
    }
    fn shared_memory_as_parameter(&self) -> bool {
        true
    }

    fn std_functions(&self) -> String {
        "size_t motif_get_global_id(unsigned int dimension) { return get_global_id(dimension); } \n\
         size_t motif_get_thread_id(unsigned int dimension) { return get_local_id(dimension); } \n\
         size_t motif_get_block_id(unsigned int dimension) { return get_group_id(dimension); } \n\
         size_t motif_get_block_size(unsigned int dimension) { return get_local_size(dimension); } \n\
         size_t motif_get_grid_size(unsigned int dimension) { return get_num_groups(dimension); } \n\
         void motif_synchronize_local_threads() { barrier(CLK_LOCAL_MEM_FENCE); } \n\
         int motif_atomic_add_int(__global int *valq, int delta){ return atomic_add(valq, delta); } \n\
         double motif_atomic_add_double(__global double *valq, double delta){ \n \
             union { double f; unsigned long i; } old; \n\
             union { double f; unsigned long i; } new1; \n\
             do { \n\
                 old.f = *valq; \n\
                 new1.f = old.f + delta; \n\
             } while (atom_cmpxchg((volatile __global unsigned long *)valq, old.i, new1.i) != old.i); \n\
             return old.f; \n\
         } \n"
            .to_string()
    }
}

/// One user parameter as the builder needs to see it.
#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: String,
    /// Identifier in the kernel parameter list (renamed when batched).
    pub kernel_name: String,
    /// Full C type as declared in the parameter list.
    pub declared_type: String,
    /// C type of the per-batch view the body works with.
    pub rebind_type: String,
    pub kind: ParamKind,
    pub batched: bool,
    pub is_const_in: bool,
}

/// The per-block shared buffer, when a pattern uses one.
#[derive(Debug, Clone)]
pub struct SharedDecl {
    pub name: String,
    pub scalar_type: String,
}

/// Assembles a complete kernel from its fragments.
pub struct KernelSourceBuilder<'g> {
    generator: &'g dyn KernelGenerator,
    kernel_name: String,
    dims: Dimensions,
    std_var_names: [String; SUPPORTED_DIMS],
    batched: bool,
    params: Vec<ParamDecl>,
    shared: Option<SharedDecl>,
    extra_code: String,
    body: String,
}

impl<'g> KernelSourceBuilder<'g> {
    pub fn new(generator: &'g dyn KernelGenerator, kernel_name: &str, dims: Dimensions) -> Self {
        Self {
            generator,
            kernel_name: kernel_name.to_string(),
            dims,
            std_var_names: ["x".into(), "y".into(), "z".into()],
            batched: false,
            params: Vec::new(),
            shared: None,
            extra_code: String::new(),
            body: String::new(),
        }
    }

    pub fn with_std_var_names(mut self, names: [String; SUPPORTED_DIMS]) -> Self {
        self.std_var_names = names;
        self
    }

    pub fn with_batched(mut self, batched: bool) -> Self {
        self.batched = batched;
        self
    }

    pub fn with_param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_shared(mut self, shared: SharedDecl) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_extra_code(mut self, code: &str) -> Self {
        self.extra_code = code.to_string();
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    fn var(&self, axis: usize) -> &str {
        &self.std_var_names[axis]
    }

    /// The parenthesized parameter list: per-axis bounds, optional batch
    /// size, then user parameters in registration order.
    pub fn params_fragment(&self) -> String {
        let mut r = String::new();
        for d in 0..SUPPORTED_DIMS {
            if !self.dims.is(d) {
                continue;
            }
            let var = self.var(d);
            r.push_str(&format!("const unsigned long motif_max_{var},"));
            if self.dims[d].min != 0 && !self.batched {
                r.push_str(&format!("const unsigned long motif_min_{var},"));
            }
        }
        if self.batched {
            r.push_str("unsigned int motif_batch_size,");
        }
        let global = self.generator.global_memory_prefix();
        for p in &self.params {
            if (p.kind == ParamKind::Pointer || p.batched) && !global.is_empty() {
                r.push_str(global);
                r.push(' ');
            }
            if p.is_const_in {
                r.push_str("const ");
            }
            r.push_str(&format!("{} {},", p.declared_type, p.kernel_name));
        }
        match &self.shared {
            Some(shared) if self.generator.shared_memory_as_parameter() => {
                r.push_str(&format!(
                    "{} {}* {}",
                    self.generator.shared_memory_prefix(),
                    shared.scalar_type,
                    shared.name
                ));
            }
            _ => {
                r.pop();
            }
        }
        r
    }

    /// Body prologue: the shared-memory declaration for dialects that put
    /// it inside the kernel.
    pub fn init_fragment(&self) -> String {
        match &self.shared {
            Some(shared) if !self.generator.shared_memory_as_parameter() => format!(
                "{} {} {}[];",
                self.generator.shared_memory_prefix(),
                shared.scalar_type,
                shared.name
            ),
            _ => String::new(),
        }
    }

    /// Per-axis standard variables, plus the batch split when batched.
    pub fn std_vars_fragment(&self) -> String {
        let mut r = String::new();
        for d in 0..SUPPORTED_DIMS {
            if !self.dims.is(d) {
                continue;
            }
            let var = self.var(d);
            if self.batched {
                r.push_str(&format!("size_t motif_global_{var}"));
            } else {
                r.push_str(&format!("size_t {var}"));
            }
            r.push_str(&format!(" = motif_get_global_id({d})"));
            if self.dims[d].min != 0 && !self.batched {
                r.push_str(&format!(" + motif_min_{var}"));
            }
            r.push_str("; \n");
            if self.batched {
                // Integer division truncates, yielding the batch index.
                r.push_str(&format!(
                    "size_t motif_batch_{var} = ((size_t)(motif_global_{var} / motif_max_{var})); \n"
                ));
                r.push_str(&format!(
                    "size_t motif_offset_{var} = motif_batch_{var} * motif_max_{var}; \n"
                ));
                r.push_str(&format!(
                    "size_t {var} = motif_global_{var} - motif_offset_{var}; \n"
                ));
            }
        }
        r
    }

    /// Rebinds each batched parameter to its per-batch view.
    pub fn batched_init_fragment(&self) -> String {
        let first_var = self.var(0);
        let global = self.generator.global_memory_prefix();
        let mut r = String::new();
        for p in &self.params {
            if !p.batched {
                continue;
            }
            if p.kind == ParamKind::Pointer && !global.is_empty() {
                r.push_str(global);
                r.push(' ');
            }
            if p.is_const_in {
                r.push_str("const ");
            }
            r.push_str(&format!("{} {} = ", p.rebind_type, p.name));
            match p.kind {
                ParamKind::Pointer => {
                    r.push_str(&format!("&{}[motif_offset_{first_var}]", p.kernel_name));
                }
                ParamKind::Value => {
                    r.push_str(&format!("{}[motif_batch_{first_var}]", p.kernel_name));
                }
            }
            r.push_str(";\n");
        }
        r
    }

    /// The bounds guard wrapped around the pattern core.
    pub fn control_if_fragment(&self) -> (String, String) {
        let mut r = String::from("if (");
        for d in 0..SUPPORTED_DIMS {
            if !self.dims.is(d) {
                continue;
            }
            let var = self.var(d);
            if self.batched {
                r.push_str(&format!("(motif_batch_{var} < motif_batch_size)&&"));
            }
            r.push_str(&format!("({var} < motif_max_{var})&&"));
        }
        r.truncate(r.len() - 2);
        r.push_str(") {\n");
        (r, "}".to_string())
    }

    /// The complete kernel source, ready for the backend compiler.
    pub fn build(&self) -> String {
        let (guard_open, guard_close) = self.control_if_fragment();
        let extra = if self.extra_code.is_empty() {
            String::new()
        } else {
            format!("{}\n", self.extra_code)
        };
        format!(
            "{extra}{prefix} void {name}({params}) {{\n{init}\n{std_vars}{batched}\n{guard_open}{body}\n{guard_close}\n}}\n",
            prefix = self.generator.kernel_prefix(),
            name = self.kernel_name,
            params = self.params_fragment(),
            init = self.init_fragment(),
            std_vars = self.std_vars_fragment(),
            batched = self.batched_init_fragment(),
            body = self.body,
        )
    }
}
