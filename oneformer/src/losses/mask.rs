//! Point-sampled mask losses.
//!
//! Both losses take mask logits and binary labels evaluated at the same sampled
//! points, sum over masks and normalize by the number of ground-truth masks in the
//! batch rather than by the number of matched pairs.

use burn::{prelude::*, tensor::activation::sigmoid};

use crate::error::{OneFormerError, OneFormerResult};

/// Numerically stable `log(1 + exp(x))`.
pub(crate) fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_min(0.0) + x.abs().neg().exp().log1p()
}

/// Element-wise binary cross-entropy on logits.
///
/// Uses `max(x, 0) - x * y + log(1 + exp(-|x|))`, which never exponentiates a
/// positive number.
pub fn binary_cross_entropy_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    labels: Tensor<B, D>,
) -> Tensor<B, D> {
    softplus(logits.clone()) - logits * labels
}

fn check_same_shape<B: Backend>(logits: &Tensor<B, 2>, labels: &Tensor<B, 2>) -> OneFormerResult<()> {
    if logits.dims() != labels.dims() {
        return Err(OneFormerError::shape_mismatch(
            format!("labels of shape {:?}", logits.dims()),
            format!("{:?}", labels.dims()),
        ));
    }
    Ok(())
}

/// Sigmoid cross-entropy averaged over points, summed over masks and divided by `num_masks`.
///
/// # Shapes
/// - logits, labels: `[masks, points]`
/// - output: `[1]`
///
/// # Errors
///
/// Returns `Err(OneFormerError::ShapeMismatch)` if the shapes differ.
pub fn sigmoid_ce_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2>,
    num_masks: f64,
) -> OneFormerResult<Tensor<B, 1>> {
    check_same_shape(&logits, &labels)?;

    let loss = binary_cross_entropy_with_logits(logits, labels).mean_dim(1);
    Ok(loss.sum() / num_masks)
}

/// Dice loss `1 - (2 * sum(p * y) + 1) / (sum(p) + sum(y) + 1)` with `p = sigmoid(logits)`,
/// summed over masks and divided by `num_masks`.
///
/// # Shapes
/// - logits, labels: `[masks, points]`
/// - output: `[1]`
///
/// # Errors
///
/// Returns `Err(OneFormerError::ShapeMismatch)` if the shapes differ.
pub fn dice_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2>,
    num_masks: f64,
) -> OneFormerResult<Tensor<B, 1>> {
    check_same_shape(&logits, &labels)?;

    let probs = sigmoid(logits);
    let numerator = (probs.clone() * labels.clone()).sum_dim(1) * 2.0;
    let denominator = probs.sum_dim(1) + labels.sum_dim(1);
    let loss = (numerator + 1.0).div(denominator + 1.0).neg() + 1.0;

    Ok(loss.sum() / num_masks)
}
