//! Motif: cross-backend GPU execution through parallel patterns
//!
//! Motif generates, compiles and launches GPU kernels at runtime from a
//! user-supplied expression and a registered parameter list, behind a
//! pattern API that is identical across backends.
//!
//! # Architecture
//!
//! - **pattern**: the Map, Reduce and composition patterns and the engine
//!   they share (parameter registry, compile cache, memory orchestration)
//! - **driver**: the backend contract plus kernel-source generation and the
//!   block/thread launch mapping
//! - **dims**: the 1-3 axis iteration space with per-axis bounds
//! - **param**: typed kernel parameters with direction and batching
//!
//! Backends are feature gated:
//! - `cuda`: NVIDIA GPUs through NVRTC and the CUDA driver API
//! - `opencl`: any OpenCL 1.2+ device
//!
//! The emulated `dummy` backend is always available and records every
//! compile and launch instead of executing them.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "opencl")]
//! # fn main() -> motif::Result<()> {
//! use motif::driver::opencl::OpenCl;
//! use motif::prelude::*;
//!
//! let ctx = <OpenCl as Driver>::Context::init()?;
//! let mut a = vec![1.0f32; 1024];
//! let b = vec![2.0f32; 1024];
//!
//! let mut map = Map::<OpenCl>::new(&ctx, "a[x] = a[x] + b[x];");
//! map.set_parameter_pointer("a", a.as_mut_ptr(), a.len(), Direction::InOut)?;
//! map.set_parameter_pointer("b", b.as_ptr() as *mut f32, b.len(), Direction::In)?;
//! map.run(&Dimensions::new(1024, 0, 0))?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "opencl"))]
//! # fn main() {}
//! ```

pub mod dims;
pub mod driver;
pub mod error;
pub mod param;
pub mod pattern;

pub use dims::{Dimensions, SingleDimension};
pub use error::{Error, Result};
pub use param::{Direction, ParamKind, Parameter};
pub use pattern::{Map, Pattern, PatternComposition, PatternItem, Reduce};

/// Commonly used types and traits.
pub mod prelude {
    pub use crate::dims::{Dimensions, SingleDimension};
    pub use crate::driver::{Context, Device, Driver};
    pub use crate::error::{Error, Result};
    pub use crate::param::{Direction, ParamKind};
    pub use crate::pattern::{Map, Pattern, PatternComposition, PatternItem, Reduce};
}
