//! # Finite-Range Guard
//!
//! Deep post-norm transformer stacks occasionally overflow in reduced precision.
//! [`clamp_non_finite`] pulls such activations back into the representable range
//! instead of letting `inf` propagate into the next layer.

use burn::{prelude::*, tensor::ElementConversion};

/// Margin kept below the largest finite `f32` when clamping.
const CLAMP_MARGIN: f64 = 1000.0;

/// Clamps `x` into the finite `f32` range if it contains `inf` or `NaN`.
///
/// Returns the (possibly clamped) tensor and whether the guard fired. `NaN`
/// entries are left as they are, only infinities are brought back into range.
pub fn clamp_non_finite<B: Backend, const D: usize>(x: Tensor<B, D>) -> (Tensor<B, D>, bool) {
    let has_nan = x.clone().is_nan().any().int().into_scalar().elem::<i64>() > 0;
    let max_abs = x.clone().abs().max().into_scalar().elem::<f64>();

    if !has_nan && max_abs.is_finite() {
        return (x, false);
    }

    let bound = f64::from(f32::MAX) - CLAMP_MARGIN;
    (x.clamp(-bound, bound), true)
}
