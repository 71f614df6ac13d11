//! Reduce: a generated shared-memory tree reduction plus the host-side
//! multi-pass loop that folds per-block partial totals down to one value.

use std::ops::{Deref, DerefMut};

use crate::dims::Dimensions;
use crate::driver::{Driver, Kernel, MemoryObject};
use crate::error::{Error, Result};
use crate::param::{DeviceBinding, Direction, HostBinding, ParamKind, Parameter};
use crate::pattern::base::{lock, CompiledKernel, Pattern, PatternCore};

const PARTIAL_TOTALS: &str = "motif_partial_totals";

pub struct Reduce<D: Driver> {
    core: PatternCore<D>,
    input_name: String,
    operation: String,
    output_name: String,
}

impl<D: Driver> Reduce<D> {
    /// Reduces the pointer parameter `input` with the associative binary
    /// `operation` into the single-element pointer parameter `output`. The
    /// operation is an infix operator token (`+`, `*`) or one of `min` /
    /// `max`, which render as comparisons valid in both dialects.
    ///
    /// An `output` registered with direction IN acts as a seed folded into
    /// the final value.
    pub fn new(ctx: &D::Context, input: &str, operation: &str, output: &str) -> Self {
        let mut core = PatternCore::new(ctx, "");
        core.use_shared_memory = true;
        Self {
            core,
            input_name: input.to_string(),
            operation: operation.to_string(),
            output_name: output.to_string(),
        }
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            core: self.core.clone_core()?,
            input_name: self.input_name.clone(),
            operation: self.operation.clone(),
            output_name: self.output_name.clone(),
        })
    }

    fn output_param(&self) -> Result<std::sync::Arc<std::sync::Mutex<Parameter<D>>>> {
        self.core
            .param(&self.output_name)
            .ok_or_else(|| Error::UnknownParameter(self.output_name.clone()))
    }

    /// Renders one fold step of the reduction for the configured operation.
    fn fold_expr(&self, a: &str, b: &str) -> String {
        match self.operation.as_str() {
            "min" => format!("(({a}) < ({b}) ? ({a}) : ({b}))"),
            "max" => format!("(({a}) > ({b}) ? ({a}) : ({b}))"),
            op => format!("{a} {op} {b}"),
        }
    }

    fn reject_unsupported(&self, dims: &Dimensions) -> Result<()> {
        if dims.y.is_set() || dims.z.is_set() {
            return Err(Error::UnsupportedDimensions(
                "the Reduce pattern supports a single axis".into(),
            ));
        }
        if self.core.is_batched() {
            return Err(Error::BatchingUnsupported("the Reduce pattern"));
        }
        Ok(())
    }

    /// Drives the generated kernel until one block covers the remaining
    /// extent, then moves the final value into the caller's output.
    fn run_passes(&mut self, ck: &mut CompiledKernel<D>, dims: &Dimensions) -> Result<()> {
        ck.kernel.clear_args();
        self.before_allocating_memory(dims, &mut ck.kernel)?;
        self.core.malloc_params()?;
        self.core.copy_params_in()?;

        let input = self
            .core
            .param(&self.input_name)
            .ok_or_else(|| Error::UnknownParameter(self.input_name.clone()))?;
        let partials = self
            .core
            .param(PARTIAL_TOTALS)
            .ok_or_else(|| Error::UnknownParameter(PARTIAL_TOTALS.to_string()))?;

        let order = self.core.param_order().to_vec();
        let mut dims_to_run = *dims;
        let mut reading_partials = false;
        loop {
            let launch = ck.kernel.blocks_and_threads_for(&dims_to_run)?;
            let shared = self.shared_memory_bytes(&dims_to_run, &ck.kernel)?;
            ck.kernel.set_shared_memory_bytes(shared);
            self.core.apply_thread_overrides(&mut ck.kernel);
            self.core.set_dims_args(&mut ck.kernel, &dims_to_run)?;
            for name in &order {
                if *name == self.input_name {
                    // After the first pass the partial totals become the
                    // input of the next one.
                    let source = if reading_partials { &partials } else { &input };
                    let mut p = lock(source);
                    if let DeviceBinding::Memory(mem) = &mut p.device {
                        mem.wait_async()?;
                        ck.kernel.set_memory_arg(mem)?;
                    } else {
                        return Err(Error::IncompleteParameter(p.name.clone()));
                    }
                } else {
                    self.core.set_param_arg(&mut ck.kernel, name)?;
                }
            }
            log::debug!(
                "reduce pass over {dims_to_run} -> {} block(s)",
                launch.axes[0].blocks
            );
            self.core.launch(&mut ck.kernel, &dims_to_run)?;
            ck.kernel.wait_async()?;

            if launch.axes[0].blocks == 1 {
                break;
            }
            dims_to_run = Dimensions::new(launch.axes[0].blocks, 0, 0);
            reading_partials = true;
            ck.kernel.clear_args();
        }

        // The single remaining partial is the result; copy it straight into
        // the caller's output buffer and skip the regular copy-out for it.
        let output = self.output_param()?;
        let restore_direction;
        {
            let mut out = lock(&output);
            let (out_ptr, out_size) = match &out.host {
                HostBinding::Pointer(ptr) => (*ptr, out.size),
                _ => return Err(Error::IncompleteParameter(out.name.clone())),
            };
            let mut p = lock(&partials);
            match &mut p.device {
                DeviceBinding::Memory(mem) => {
                    mem.bind_to(out_ptr, out_size);
                    mem.copy_out()?;
                }
                _ => return Err(Error::IncompleteParameter(p.name.clone())),
            }
            restore_direction = out.direction;
            out.direction = Direction::None;
        }
        self.core.copy_params_out()?;
        lock(&output).direction = restore_direction;
        Ok(())
    }
}

impl<D: Driver> Deref for Reduce<D> {
    type Target = PatternCore<D>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl<D: Driver> DerefMut for Reduce<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.core
    }
}

impl<D: Driver> Pattern<D> for Reduce<D> {
    const PATTERN_NAME: &'static str = "Reduce";

    fn core(&self) -> &PatternCore<D> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PatternCore<D> {
        &mut self.core
    }

    /// One compiled kernel serves every pass: each pass re-launches it with
    /// a shrinking extent, so only the axis count has to match.
    fn is_compiled_for(&self, dims: &Dimensions) -> bool {
        self.core.is_compiled()
            && !self.core.is_stale()
            && self
                .core
                .compiled_dims()
                .map(|compiled| compiled.count() == dims.count())
                .unwrap_or(false)
    }

    /// Registers the partial-totals output before the parameter list is
    /// rendered, so it is part of the kernel signature.
    fn before_generating_source(&mut self) -> Result<()> {
        if self.core.param(PARTIAL_TOTALS).is_none() {
            let out_ty = {
                let output = self.output_param()?;
                let out = lock(&output);
                out.ty.clone()
            };
            log::debug!("registering the partial-totals parameter ({PARTIAL_TOTALS})");
            let mut param: Parameter<D> = Parameter::placeholder::<u8>(
                PARTIAL_TOTALS,
                ParamKind::Pointer,
                Direction::Out,
                false,
            );
            param.ty = crate::param::TypeDesc::pointer(out_ty.scalar_name());
            self.core.register(param);
        }
        Ok(())
    }

    /// Sizes the partial-totals buffer to one slot per block of the first
    /// pass.
    fn before_allocating_memory(
        &mut self,
        dims: &Dimensions,
        kernel: &mut D::Kernel,
    ) -> Result<()> {
        let needs_sizing = match self.core.param(PARTIAL_TOTALS) {
            Some(param) => !lock(&param).is_complete(),
            None => true,
        };
        if !needs_sizing {
            return Ok(());
        }
        let launch = kernel.blocks_and_threads_for(dims)?;
        let (out_ty, out_size) = {
            let output = self.output_param()?;
            let out = lock(&output);
            (out.ty.clone(), out.size)
        };
        let total = launch.axes[0].blocks * out_size;
        let mut param: Parameter<D> =
            Parameter::placeholder::<u8>(PARTIAL_TOTALS, ParamKind::Pointer, Direction::Out, false);
        param.ty = crate::param::TypeDesc::pointer(out_ty.scalar_name());
        param.size = total;
        param.host = HostBinding::Owned(vec![0; total]);
        param.set_complete(true);
        self.core.register(param);
        Ok(())
    }

    /// One shared slot per thread of a block, sized once on the first pass.
    fn shared_memory_bytes(&mut self, dims: &Dimensions, kernel: &D::Kernel) -> Result<usize> {
        let output = self.output_param()?;
        let (out_ty, out_size) = {
            let out = lock(&output);
            (out.ty.clone(), out.size)
        };
        let shared = self.core.shared_memory_param(&out_ty);
        let mut p = lock(&shared);
        if !p.is_complete() {
            let launch = kernel.blocks_and_threads_for(dims)?;
            let elements = dims.x.max.min(launch.axes[0].threads);
            p.size = elements * out_size;
            p.set_complete(true);
        }
        Ok(p.size)
    }

    fn kernel_body(&mut self, dims: &Dimensions) -> Result<String> {
        self.reject_unsupported(dims)?;
        let output = self.output_param()?;
        let (out_is_in, out_ty) = {
            let out = lock(&output);
            (out.direction.is_in(), out.ty.clone())
        };
        let shared_param = self.core.shared_memory_param(&out_ty);
        let shared = lock(&shared_param).name.clone();
        if self.core.param(&self.input_name).is_none() {
            return Err(Error::UnknownParameter(self.input_name.clone()));
        }

        let input = &self.input_name;
        let out = &self.output_name;
        let gid = self.core.std_var_names()[0].clone();
        let max = format!("motif_max_{gid}");
        let tid = format!("motif_tid_{gid}");
        let bid = format!("motif_bid_{gid}");
        let bsize = format!("motif_bsize_{gid}");

        let tree_fold = self.fold_expr(
            &format!("{shared}[{tid}]"),
            &format!("{shared}[{tid}+s]"),
        );
        let stride_fold = self.fold_expr(&format!("{shared}[{tid}]"), &format!("{shared}[s-1]"));
        let tail_fold = self.fold_expr(&format!("{shared}[0]"), &format!("{shared}[{max}-1]"));

        let seed_fold = if out_is_in {
            let fold = self.fold_expr(&format!("{PARTIAL_TOTALS}[{bid}]"), &format!("*{out}"));
            format!(
                "       if (motif_get_grid_size(0) == 1) {{ \n\
                 \x20          {PARTIAL_TOTALS}[{bid}] = {fold}; \n\
                 \x20      }} \n"
            )
        } else {
            String::new()
        };

        Ok(format!(
            "   size_t {tid} = motif_get_thread_id(0); \n\
             \x20  size_t {bid} = motif_get_block_id(0); \n\
             \x20  size_t {bsize} = motif_get_block_size(0); \n\
             \x20  {shared}[{tid}] = {input}[{gid}]; \n\
             \x20  motif_synchronize_local_threads(); \n\
             \x20  for (unsigned int s={bsize}/2; s>0; s>>=1) {{ \n\
             \x20      if ({tid} < s && {gid}+s < {max}) {{ \n\
             \x20          {shared}[{tid}] = {tree_fold}; \n\
             \x20      }} \n\
             \x20      motif_synchronize_local_threads(); \n\
             \x20      if ({tid} == 0 && s > 1 && s % 2 != 0) {{ \n\
             \x20          {shared}[{tid}] = {stride_fold}; \n\
             \x20      }} \n\
             \x20      motif_synchronize_local_threads(); \n\
             \x20  }} \n\
             \x20  if ({tid} == 0) {{ \n\
             \x20      if ({bsize} % 2 != 0) {{ \n\
             \x20          {shared}[0] = {tail_fold}; \n\
             \x20      }} \n\
             \x20      {PARTIAL_TOTALS}[{bid}] = {shared}[0]; \n\
             {seed_fold}\
             \x20  }} \n"
        ))
    }

    /// Rejects unsupported shapes before any launch, then drives the
    /// multi-pass loop instead of the single-launch default.
    fn run(&mut self, dims: &Dimensions) -> Result<()> {
        self.reject_unsupported(dims)?;
        self.compile(dims)?;
        let mut ck = self.core.take_compiled()?;
        let result = self.run_passes(&mut ck, dims);
        self.core.restore_compiled(ck);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::dummy::Dummy;
    use crate::driver::Context;

    fn reduce_with_output(seed: bool) -> (Reduce<Dummy>, Box<[f64; 1]>, Box<[f64; 512]>) {
        let ctx = crate::driver::dummy::DummyContext::init().unwrap();
        let mut reduce = Reduce::<Dummy>::new(&ctx, "v", "+", "total");
        let mut data = Box::new([0.0f64; 512]);
        let mut total = Box::new([0.0f64; 1]);
        reduce
            .set_parameter_pointer("v", data.as_mut_ptr(), 512, Direction::In)
            .unwrap();
        let direction = if seed { Direction::In } else { Direction::Out };
        reduce
            .set_parameter_pointer("total", total.as_mut_ptr(), 1, direction)
            .unwrap();
        (reduce, total, data)
    }

    #[test]
    fn body_contains_the_odd_leftover_correction() {
        let (mut reduce, _total, _data) = reduce_with_output(false);
        reduce.before_generating_source().unwrap();
        let body = reduce.kernel_body(&Dimensions::new(512, 0, 0)).unwrap();
        assert!(body.contains("if (motif_tid_x == 0 && s > 1 && s % 2 != 0)"));
        assert!(body.contains("if (motif_bsize_x % 2 != 0)"));
        assert!(!body.contains("motif_get_grid_size(0) == 1"));
    }

    #[test]
    fn seed_output_folds_when_one_block_remains() {
        let (mut reduce, _total, _data) = reduce_with_output(true);
        reduce.before_generating_source().unwrap();
        let body = reduce.kernel_body(&Dimensions::new(512, 0, 0)).unwrap();
        assert!(body.contains("motif_get_grid_size(0) == 1"));
        assert!(body.contains("+ *total"));
    }

    #[test]
    fn min_renders_as_a_comparison() {
        let ctx = crate::driver::dummy::DummyContext::init().unwrap();
        let mut reduce = Reduce::<Dummy>::new(&ctx, "v", "min", "smallest");
        let mut data = [0.0f64; 64];
        let mut smallest = [0.0f64; 1];
        reduce
            .set_parameter_pointer("v", data.as_mut_ptr(), 64, Direction::In)
            .unwrap();
        reduce
            .set_parameter_pointer("smallest", smallest.as_mut_ptr(), 1, Direction::Out)
            .unwrap();
        reduce.before_generating_source().unwrap();
        let body = reduce.kernel_body(&Dimensions::new(64, 0, 0)).unwrap();
        assert!(body.contains("[motif_tid_x]) < ("));
        assert!(body.contains(" ? ("));
        assert!(!body.contains(" min "));
    }

    #[test]
    fn multi_axis_dimensions_are_rejected() {
        let (mut reduce, _total, _data) = reduce_with_output(false);
        let err = reduce.run(&Dimensions::new(8, 8, 0));
        assert!(matches!(err, Err(Error::UnsupportedDimensions(_))));
    }

    #[test]
    fn batching_is_rejected() {
        let (mut reduce, _total, _data) = reduce_with_output(false);
        reduce.set_batch_size(4);
        let err = reduce.run(&Dimensions::new(512, 0, 0));
        assert!(matches!(err, Err(Error::BatchingUnsupported(_))));
    }

    #[test]
    fn missing_output_parameter_is_reported() {
        let ctx = crate::driver::dummy::DummyContext::init().unwrap();
        let mut reduce = Reduce::<Dummy>::new(&ctx, "v", "+", "total");
        let mut data = [0.0f64; 16];
        reduce
            .set_parameter_pointer("v", data.as_mut_ptr(), 16, Direction::In)
            .unwrap();
        let err = reduce.run(&Dimensions::new(16, 0, 0));
        assert!(matches!(err, Err(Error::UnknownParameter(name)) if name == "total"));
    }
}
