//! Parallel patterns: the compile/run orchestrator and the Map, Reduce and
//! composition patterns built on it.

pub mod base;
pub mod composition;
pub mod map;
pub mod reduce;

pub use base::{Pattern, PatternCore};
pub use composition::{PatternComposition, PatternItem};
pub use map::Map;
pub use reduce::Reduce;
