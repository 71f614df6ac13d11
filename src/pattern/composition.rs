//! Composition: a sequence of patterns compiled together, one combined
//! source (and one driver compilation) per device, then run in order.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::dims::Dimensions;
use crate::driver::{Device, Driver};
use crate::error::Result;
use crate::pattern::base::Pattern;
use crate::pattern::map::Map;
use crate::pattern::reduce::Reduce;

/// A pattern held by a composition.
pub enum PatternItem<D: Driver> {
    Map(Map<D>),
    Reduce(Reduce<D>),
}

impl<D: Driver> PatternItem<D> {
    pub fn pattern_name(&self) -> &'static str {
        match self {
            PatternItem::Map(_) => <Map<D> as Pattern<D>>::PATTERN_NAME,
            PatternItem::Reduce(_) => <Reduce<D> as Pattern<D>>::PATTERN_NAME,
        }
    }

    pub fn as_map(&mut self) -> Option<&mut Map<D>> {
        match self {
            PatternItem::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_reduce(&mut self) -> Option<&mut Reduce<D>> {
        match self {
            PatternItem::Reduce(reduce) => Some(reduce),
            _ => None,
        }
    }

    fn gpu_index(&self) -> usize {
        match self {
            PatternItem::Map(map) => map.core().gpu_index(),
            PatternItem::Reduce(reduce) => reduce.core().gpu_index(),
        }
    }

    fn is_compiled_for(&self, dims: &Dimensions) -> bool {
        match self {
            PatternItem::Map(map) => map.is_compiled_for(dims),
            PatternItem::Reduce(reduce) => reduce.is_compiled_for(dims),
        }
    }

    fn prepare_source(&mut self, dims: &Dimensions) -> Result<(String, String)> {
        match self {
            PatternItem::Map(map) => map.prepare_source(dims),
            PatternItem::Reduce(reduce) => reduce.prepare_source(dims),
        }
    }

    fn device(&mut self) -> Result<Arc<D::Device>> {
        match self {
            PatternItem::Map(map) => map.core_mut().device(),
            PatternItem::Reduce(reduce) => reduce.core_mut().device(),
        }
    }

    fn install(&mut self, program: Arc<D::Program>, dims: Dimensions) -> Result<()> {
        match self {
            PatternItem::Map(map) => map.core_mut().install(program, dims),
            PatternItem::Reduce(reduce) => reduce.core_mut().install(program, dims),
        }
    }

    fn run(&mut self, dims: &Dimensions) -> Result<()> {
        match self {
            PatternItem::Map(map) => map.run(dims),
            PatternItem::Reduce(reduce) => reduce.run(dims),
        }
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            PatternItem::Map(map) => PatternItem::Map(map.try_clone()?),
            PatternItem::Reduce(reduce) => PatternItem::Reduce(reduce.try_clone()?),
        })
    }
}

impl<D: Driver> From<Map<D>> for PatternItem<D> {
    fn from(map: Map<D>) -> Self {
        PatternItem::Map(map)
    }
}

impl<D: Driver> From<Reduce<D>> for PatternItem<D> {
    fn from(reduce: Reduce<D>) -> Self {
        PatternItem::Reduce(reduce)
    }
}

/// An ordered sequence of patterns run back to back over the same
/// iteration space.
pub struct PatternComposition<D: Driver> {
    items: Vec<PatternItem<D>>,
    extra_kernel_code: String,
}

impl<D: Driver> Default for PatternComposition<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Driver> PatternComposition<D> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            extra_kernel_code: String::new(),
        }
    }

    pub fn add(&mut self, item: impl Into<PatternItem<D>>) -> &mut Self {
        self.items.push(item.into());
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&mut self, index: usize) -> Option<&mut PatternItem<D>> {
        self.items.get_mut(index)
    }

    pub fn items(&mut self) -> impl Iterator<Item = &mut PatternItem<D>> {
        self.items.iter_mut()
    }

    /// Code prepended to every combined source, shared by all members.
    pub fn add_extra_kernel_code(&mut self, code: &str) -> &mut Self {
        self.extra_kernel_code.push_str(code);
        self
    }

    /// Compiles every member that is not already compiled for `dims`,
    /// batching members per device into a single driver compilation.
    pub fn compile_patterns(&mut self, dims: &Dimensions) -> Result<()> {
        let mut per_device: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for (index, item) in self.items.iter().enumerate() {
            if item.is_compiled_for(dims) {
                continue;
            }
            per_device.entry(item.gpu_index()).or_default().push(index);
        }
        for (gpu, indices) in per_device {
            let mut names = Vec::with_capacity(indices.len());
            let mut combined = self.extra_kernel_code.clone();
            for &index in &indices {
                let (name, source) = self.items[index].prepare_source(dims)?;
                combined.push_str(&source);
                combined.push('\n');
                names.push(name);
            }
            log::debug!(
                "compiling {} pattern kernel(s) together on device {gpu}",
                names.len()
            );
            let device = self.items[indices[0]].device()?;
            let programs = device.prepare_kernels(&combined, &names)?;
            for (&index, program) in indices.iter().zip(programs) {
                self.items[index].install(Arc::new(program), *dims)?;
            }
        }
        Ok(())
    }

    /// Compiles what is missing, then runs every member in order.
    pub fn run(&mut self, dims: &Dimensions) -> Result<()> {
        self.compile_patterns(dims)?;
        for item in &mut self.items {
            item.run(dims)?;
        }
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Self> {
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            items.push(item.try_clone()?);
        }
        Ok(Self {
            items,
            extra_kernel_code: self.extra_kernel_code.clone(),
        })
    }
}
