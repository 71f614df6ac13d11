//! Iteration-space description: up to three axes, each with an exclusive
//! upper bound and an optional lower bound.

use std::fmt;
use std::ops::{Index, IndexMut, Mul};

use crate::error::{Error, Result};

/// Number of axes the runtime understands.
pub const SUPPORTED_DIMS: usize = 3;

const AXIS_NAMES: [&str; SUPPORTED_DIMS] = ["x", "y", "z"];

/// One axis of the iteration space. A `max` of zero means the axis is
/// unused; `min` shifts the generated index without changing the thread
/// count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleDimension {
    pub max: usize,
    pub min: usize,
}

impl SingleDimension {
    pub const fn new(max: usize) -> Self {
        Self { max, min: 0 }
    }

    pub const fn with_min(max: usize, min: usize) -> Self {
        Self { max, min }
    }

    /// Whether this axis participates in the launch.
    pub fn is_set(&self) -> bool {
        self.max != 0
    }

    /// Number of indices the axis actually covers.
    pub fn delta(&self) -> usize {
        self.max - self.min
    }

    pub fn scaled(&self, factor: usize) -> Self {
        Self {
            max: self.max * factor,
            min: self.min * factor,
        }
    }
}

impl From<usize> for SingleDimension {
    fn from(max: usize) -> Self {
        Self::new(max)
    }
}

impl fmt::Display for SingleDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.min, self.max)
    }
}

/// The full iteration space. Axes must be populated contiguously: X before
/// Y, Y before Z.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    pub x: SingleDimension,
    pub y: SingleDimension,
    pub z: SingleDimension,
}

impl Dimensions {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            z: z.into(),
        }
    }

    pub fn with_bounds(x: SingleDimension, y: SingleDimension, z: SingleDimension) -> Self {
        Self { x, y, z }
    }

    /// Number of axes in use.
    pub fn count(&self) -> usize {
        (0..SUPPORTED_DIMS).filter(|&d| self.is(d)).count()
    }

    /// Whether the given axis participates in the launch.
    pub fn is(&self, axis: usize) -> bool {
        self[axis].is_set()
    }

    /// Static name of an axis, used for generated identifiers.
    pub fn axis_name(axis: usize) -> &'static str {
        AXIS_NAMES[axis]
    }

    /// Checks the contiguity invariant: no axis may be set unless every
    /// lower axis is set too.
    pub fn validate(&self) -> Result<()> {
        if !self.x.is_set() {
            if self.count() > 0 {
                return Err(Error::MissingFirstAxis);
            }
            return Err(Error::UnsupportedDimensions(
                "no axis of the iteration space is set".into(),
            ));
        }
        if self.z.is_set() && !self.y.is_set() {
            return Err(Error::UnsupportedDimensions(
                "the Z axis is set but the Y axis is not".into(),
            ));
        }
        Ok(())
    }

    /// Scales every active axis, used to widen the first pass of a batched
    /// launch.
    pub fn scaled(&self, factor: usize) -> Self {
        let scale = |d: SingleDimension| if d.is_set() { d.scaled(factor) } else { d };
        Self {
            x: scale(self.x),
            y: scale(self.y),
            z: scale(self.z),
        }
    }
}

impl Index<usize> for Dimensions {
    type Output = SingleDimension;

    fn index(&self, axis: usize) -> &Self::Output {
        match axis {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("axis {axis} out of range"),
        }
    }
}

impl IndexMut<usize> for Dimensions {
    fn index_mut(&mut self, axis: usize) -> &mut Self::Output {
        match axis {
            0 => &mut self.x,
            1 => &mut self.y,
            2 => &mut self.z,
            _ => panic!("axis {axis} out of range"),
        }
    }
}

impl Mul<usize> for Dimensions {
    type Output = Dimensions;

    fn mul(self, factor: usize) -> Dimensions {
        self.scaled(factor)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[dim{}:", self.count())?;
        let mut first = true;
        for d in 0..SUPPORTED_DIMS {
            if self.is(d) {
                if !first {
                    write!(f, "x")?;
                }
                write!(f, "{}", self[d])?;
                first = false;
            }
        }
        write!(f, "]")
    }
}
