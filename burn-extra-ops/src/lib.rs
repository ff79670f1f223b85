//! Additional operations for the Burn deep learning framework
//!
//! This crate provides operations that are commonly used in dense-prediction models but are
//! not available in the core Burn framework with the exact semantics those models expect:
//!
//! - `grid_sample`: differentiable bilinear sampling with zero padding and
//!   `align_corners = false`, over plain or flattened multi-level feature maps.
//! - `finite`: a guard that clamps overflowing activations back into the finite range.

use burn::prelude::*;

mod finite;
mod grid_sample;

// Convenient re-exports
pub use finite::clamp_non_finite;
pub use grid_sample::{
    bilinear_sample_flat, grid_sample_bilinear, resize_bilinear, FlatLayout,
};

/// Additional operations for 4D feature-map tensors
pub trait TensorExtraOps<B: Backend> {
    /// Bilinearly sample the tensor at normalized `[-1, 1]` grid locations.
    fn grid_sample_bilinear(self, grid: Tensor<B, 4>) -> Self;

    /// Resize the spatial dimensions with `align_corners = false` bilinear interpolation.
    fn resize_bilinear(self, size: [usize; 2]) -> Self;
}

impl<B: Backend> TensorExtraOps<B> for Tensor<B, 4> {
    fn grid_sample_bilinear(self, grid: Tensor<B, 4>) -> Self {
        grid_sample_bilinear(self, grid)
    }

    fn resize_bilinear(self, size: [usize; 2]) -> Self {
        resize_bilinear(self, size)
    }
}
