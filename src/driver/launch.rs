//! Deterministic mapping from an iteration space onto (blocks, threads)
//! pairs, shared by every backend.

use crate::dims::{Dimensions, SUPPORTED_DIMS};
use crate::driver::DeviceLimits;
use crate::error::{Error, Result};

/// Register-count safety margin: launches with the literal register count
/// were observed to fail, so the ceiling leaves 15% headroom.
const REGISTER_MARGIN: f64 = 1.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisLaunch {
    pub blocks: usize,
    pub threads: usize,
}

/// Block/thread counts per axis. Inactive axes launch as 1x1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub axes: [AxisLaunch; SUPPORTED_DIMS],
}

impl Launch {
    pub fn grid(&self) -> [usize; 3] {
        [self.axes[0].blocks, self.axes[1].blocks, self.axes[2].blocks]
    }

    pub fn block(&self) -> [usize; 3] {
        [
            self.axes[0].threads,
            self.axes[1].threads,
            self.axes[2].threads,
        ]
    }
}

/// Computes the launch shape for `dims` under the device limits, the
/// register-pressure ceiling and optional per-axis user overrides
/// (`0` meaning none).
///
/// Two active axes whose combined extent exceeds the group limit split the
/// limit evenly via its square root; three active axes are rejected.
pub fn blocks_and_threads(
    dims: &Dimensions,
    limits: &DeviceLimits,
    kernel_registers: u32,
    overrides: &[usize; SUPPORTED_DIMS],
) -> Result<Launch> {
    dims.validate()?;
    let active = dims.count();
    if active > 2 {
        return Err(Error::UnsupportedDimensions(
            "cannot map 3 active axes onto a launch".into(),
        ));
    }

    let mut group_limit = limits.max_threads_per_block;
    if kernel_registers > 0 {
        let ceiling =
            limits.max_registers_per_block as f64 / (kernel_registers as f64 * REGISTER_MARGIN);
        group_limit = group_limit.min(ceiling.max(1.0) as usize);
    }

    // With two active axes sharing the group, each gets the square root of
    // the limit when the combined extent would overflow it.
    let mut per_axis_limit = group_limit;
    if active == 2 {
        let product: usize = (0..SUPPORTED_DIMS)
            .filter(|&d| dims.is(d))
            .map(|d| dims[d].delta())
            .product();
        if product > group_limit {
            per_axis_limit = (group_limit as f64).sqrt() as usize;
        }
    }

    let mut axes = [AxisLaunch {
        blocks: 1,
        threads: 1,
    }; SUPPORTED_DIMS];
    for d in 0..SUPPORTED_DIMS {
        if !dims.is(d) {
            continue;
        }
        let mut max = per_axis_limit.min(limits.max_block_dims[d]);
        if overrides[d] > 0 {
            max = max.min(overrides[d]);
        }
        let extent = dims[d].delta();
        axes[d] = if extent <= max {
            AxisLaunch {
                blocks: 1,
                threads: extent,
            }
        } else {
            AxisLaunch {
                blocks: extent.div_ceil(max),
                threads: max,
            }
        };
    }
    Ok(Launch { axes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            max_threads_per_block: 1024,
            max_block_dims: [1024, 1024, 64],
            max_registers_per_block: 65536,
        }
    }

    #[test]
    fn small_extent_fits_one_block() {
        let l = blocks_and_threads(&Dimensions::new(20, 0, 0), &limits(), 0, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 1, threads: 20 });
        assert_eq!(l.axes[1], AxisLaunch { blocks: 1, threads: 1 });
    }

    #[test]
    fn large_extent_splits_into_blocks() {
        let l = blocks_and_threads(&Dimensions::new(2050, 0, 0), &limits(), 0, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 3, threads: 1024 });
    }

    #[test]
    fn exact_multiple_has_no_partial_block() {
        let l = blocks_and_threads(&Dimensions::new(2048, 0, 0), &limits(), 0, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 2, threads: 1024 });
    }

    #[test]
    fn two_axes_split_the_group_limit() {
        let l = blocks_and_threads(&Dimensions::new(64, 64, 0), &limits(), 0, &[0; 3]).unwrap();
        // 64 * 64 > 1024, so each axis is capped at sqrt(1024) = 32.
        assert_eq!(l.axes[0], AxisLaunch { blocks: 2, threads: 32 });
        assert_eq!(l.axes[1], AxisLaunch { blocks: 2, threads: 32 });
    }

    #[test]
    fn two_small_axes_share_one_block() {
        let l = blocks_and_threads(&Dimensions::new(16, 16, 0), &limits(), 0, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 1, threads: 16 });
        assert_eq!(l.axes[1], AxisLaunch { blocks: 1, threads: 16 });
    }

    #[test]
    fn three_axes_are_rejected() {
        let err = blocks_and_threads(&Dimensions::new(8, 8, 8), &limits(), 0, &[0; 3]);
        assert!(matches!(err, Err(Error::UnsupportedDimensions(_))));
    }

    #[test]
    fn register_pressure_lowers_the_ceiling() {
        // 65536 / (128 * 1.15) = 445.2 -> 445.
        let l = blocks_and_threads(&Dimensions::new(4096, 0, 0), &limits(), 128, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 10, threads: 445 });
    }

    #[test]
    fn register_ceiling_is_used_unrounded() {
        // 65536 / (80 * 1.15) = 712.3 -> 712, with no further rounding.
        let l = blocks_and_threads(&Dimensions::new(1000, 0, 0), &limits(), 80, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 2, threads: 712 });
    }

    #[test]
    fn user_override_caps_threads() {
        let l =
            blocks_and_threads(&Dimensions::new(1000, 0, 0), &limits(), 0, &[128, 0, 0]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 8, threads: 128 });
    }

    #[test]
    fn min_bound_reduces_the_extent() {
        let dims = Dimensions::with_bounds(
            crate::dims::SingleDimension::with_min(1044, 20),
            Default::default(),
            Default::default(),
        );
        let l = blocks_and_threads(&dims, &limits(), 0, &[0; 3]).unwrap();
        assert_eq!(l.axes[0], AxisLaunch { blocks: 1, threads: 1024 });
    }
}
