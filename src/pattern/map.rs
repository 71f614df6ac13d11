//! Map: the kernel core is the user-supplied expression, evaluated once
//! per index of the iteration space.

use std::ops::{Deref, DerefMut};

use crate::dims::Dimensions;
use crate::driver::Driver;
use crate::error::Result;
use crate::pattern::base::{Pattern, PatternCore};

pub struct Map<D: Driver> {
    core: PatternCore<D>,
}

impl<D: Driver> Map<D> {
    /// `source` is the per-index expression, referencing parameters by name
    /// and the standard variables (`x`, `y`, `z`) for the current index.
    pub fn new(ctx: &D::Context, source: &str) -> Self {
        Self {
            core: PatternCore::new(ctx, source),
        }
    }

    /// Shares the compiled program and the parameter registry; the clone
    /// owns its argument binding and execution flow.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            core: self.core.clone_core()?,
        })
    }
}

impl<D: Driver> Deref for Map<D> {
    type Target = PatternCore<D>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl<D: Driver> DerefMut for Map<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.core
    }
}

impl<D: Driver> Pattern<D> for Map<D> {
    const PATTERN_NAME: &'static str = "Map";

    fn core(&self) -> &PatternCore<D> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PatternCore<D> {
        &mut self.core
    }

    fn kernel_body(&mut self, _dims: &Dimensions) -> Result<String> {
        Ok(self.core.user_kernel().to_string())
    }
}
