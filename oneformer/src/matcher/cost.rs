//! Pairwise matching costs between the predictions and the ground truth of one image.

use burn::{prelude::*, tensor::activation::sigmoid};
use rand::Rng;
use tracing::trace;

use crate::{
    error::{OneFormerError, OneFormerResult},
    host::{to_host_f32, uniform_coords},
    losses::mask::softplus,
    sampling::point_sample,
};

/// Dense `queries x targets` cost matrix on the host, in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl CostMatrix {
    /// Wraps row-major `values`.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if `values.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, values: Vec<f64>) -> OneFormerResult<Self> {
        if values.len() != rows * cols {
            return Err(OneFormerError::shape_mismatch(
                format!("{} cost entries for a {rows}x{cols} matrix", rows * cols),
                format!("{} entries", values.len()),
            ));
        }
        Ok(Self { rows, cols, values })
    }

    /// A `rows x 0` matrix, used for images without targets.
    pub const fn without_targets(rows: usize) -> Self {
        Self {
            rows,
            cols: 0,
            values: Vec::new(),
        }
    }

    /// Number of predictions.
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of targets.
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Cost of assigning prediction `row` to target `col`.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    /// Costs of prediction `row` against every target.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.cols..(row + 1) * self.cols]
    }

    /// All costs in row-major order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Computes the weighted classification, mask and dice costs used for matching.
///
/// Mask costs are estimated at `num_points` random points shared by every pair of
/// the same image. The weights are checked once, when the engine is built.
#[derive(Debug, Clone)]
pub struct PairwiseCostEngine {
    class_weight: f64,
    mask_weight: f64,
    dice_weight: f64,
    num_points: usize,
}

impl PairwiseCostEngine {
    /// Creates an engine with the given cost weights and point budget.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if a weight is negative or
    /// not finite, if all weights are zero, or if `num_points` is zero.
    pub fn new(
        class_weight: f64,
        mask_weight: f64,
        dice_weight: f64,
        num_points: usize,
    ) -> OneFormerResult<Self> {
        for (name, weight) in [
            ("class", class_weight),
            ("mask", mask_weight),
            ("dice", dice_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(OneFormerError::InvalidConfiguration {
                    reason: format!("{name} cost weight must be finite and non-negative, got {weight}"),
                });
            }
        }
        if class_weight == 0.0 && mask_weight == 0.0 && dice_weight == 0.0 {
            return Err(OneFormerError::invalid_configuration(
                "all matching costs can't be 0",
            ));
        }
        if num_points == 0 {
            return Err(OneFormerError::invalid_configuration(
                "matching needs at least one sampled point",
            ));
        }

        Ok(Self {
            class_weight,
            mask_weight,
            dice_weight,
            num_points,
        })
    }

    /// Points sampled per image.
    pub const fn num_points(&self) -> usize {
        self.num_points
    }

    /// Computes the `queries x targets` cost matrix of one image.
    ///
    /// # Arguments
    /// * `class_probs` - Softmax class probabilities, `[queries, num_classes + 1]`
    /// * `mask_logits` - Predicted mask logits, `[queries, height, width]`
    /// * `target_masks` - Binary target masks, `[targets, target_height, target_width]`
    /// * `target_labels` - Class of each target, excluding the no-object class
    /// * `rng` - Source of the shared point coordinates
    ///
    /// Predicted and target masks may have different resolutions; both are sampled
    /// at the same normalized coordinates. The three cost terms are computed in the
    /// backend's float type, then read back and combined in `f64` on the host.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if the query counts, the target
    /// counts or the label range disagree.
    pub fn compute<B: Backend, R: Rng>(
        &self,
        class_probs: Tensor<B, 2>,
        mask_logits: Tensor<B, 3>,
        target_masks: Tensor<B, 3>,
        target_labels: &[usize],
        rng: &mut R,
    ) -> OneFormerResult<CostMatrix> {
        let [queries, classes] = class_probs.dims();
        let [mask_queries, height, width] = mask_logits.dims();
        let [targets, target_height, target_width] = target_masks.dims();

        if mask_queries != queries {
            return Err(OneFormerError::shape_mismatch(
                format!("{queries} predicted masks"),
                format!("{mask_queries} predicted masks"),
            ));
        }
        if targets != target_labels.len() {
            return Err(OneFormerError::shape_mismatch(
                format!("{} target masks", target_labels.len()),
                format!("{targets} target masks"),
            ));
        }
        if targets == 0 {
            return Ok(CostMatrix::without_targets(queries));
        }
        if let Some(label) = target_labels.iter().find(|label| **label + 1 >= classes) {
            return Err(OneFormerError::shape_mismatch(
                format!("target labels below {}", classes - 1),
                format!("label {label}"),
            ));
        }

        let device = class_probs.device();
        let labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                target_labels.iter().map(|label| *label as i64).collect::<Vec<_>>(),
                [targets],
            ),
            &device,
        );
        let cost_class = class_probs.select(1, labels).neg();

        let coords = Tensor::<B, 3>::from_data(
            TensorData::new(uniform_coords(rng, self.num_points * 2), [1, self.num_points, 2]),
            &device,
        );
        let pred_points = point_sample(
            mask_logits.reshape([1, queries, height, width]),
            coords.clone(),
        )?
        .reshape([queries, self.num_points]);
        let target_points = point_sample(
            target_masks.reshape([1, targets, target_height, target_width]),
            coords,
        )?
        .reshape([targets, self.num_points]);

        let cost_mask = pairwise_sigmoid_ce_loss(pred_points.clone(), target_points.clone())?;
        let cost_dice = pairwise_dice_loss(pred_points, target_points)?;

        let cost_class = to_host_f32(cost_class, "read class cost")?;
        let cost_mask = to_host_f32(cost_mask, "read mask cost")?;
        let cost_dice = to_host_f32(cost_dice, "read dice cost")?;

        let values = cost_class
            .iter()
            .zip(&cost_mask)
            .zip(&cost_dice)
            .map(|((class, mask), dice)| {
                self.mask_weight * f64::from(*mask)
                    + self.class_weight * f64::from(*class)
                    + self.dice_weight * f64::from(*dice)
            })
            .collect();

        trace!(queries, targets, points = self.num_points, "computed matching cost");

        CostMatrix::new(queries, targets, values)
    }
}

fn check_point_counts<B: Backend>(
    logits: &Tensor<B, 2>,
    labels: &Tensor<B, 2>,
) -> OneFormerResult<()> {
    let [_, points] = logits.dims();
    let [_, label_points] = labels.dims();
    if points != label_points {
        return Err(OneFormerError::shape_mismatch(
            format!("{points} points per target"),
            format!("{label_points} points per target"),
        ));
    }
    Ok(())
}

/// Sigmoid cross-entropy between every prediction and every target, averaged over points.
///
/// # Shapes
/// - logits: `[queries, points]`
/// - labels: `[targets, points]`
/// - output: `[queries, targets]`
///
/// # Errors
///
/// Returns `Err(OneFormerError::ShapeMismatch)` if the point counts differ.
pub fn pairwise_sigmoid_ce_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2>,
) -> OneFormerResult<Tensor<B, 2>> {
    check_point_counts(&logits, &labels)?;
    let [_, points] = logits.dims();

    // Loss against an all-ones and an all-zeros label; the true label picks between them.
    let positive = softplus(logits.clone().neg());
    let negative = softplus(logits);

    let loss = positive.matmul(labels.clone().transpose())
        + negative.matmul(labels.neg().add_scalar(1.0).transpose());
    Ok(loss / points as f64)
}

/// Dice loss between every prediction and every target.
///
/// # Shapes
/// - logits: `[queries, points]`
/// - labels: `[targets, points]`
/// - output: `[queries, targets]`
///
/// # Errors
///
/// Returns `Err(OneFormerError::ShapeMismatch)` if the point counts differ.
pub fn pairwise_dice_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2>,
) -> OneFormerResult<Tensor<B, 2>> {
    check_point_counts(&logits, &labels)?;

    let probs = sigmoid(logits);
    let numerator = probs.clone().matmul(labels.clone().transpose()) * 2.0;
    let denominator = probs.sum_dim(1) + labels.sum_dim(1).transpose();

    Ok((numerator + 1.0).div(denominator + 1.0).neg() + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::mask::{dice_loss, sigmoid_ce_loss};
    use burn::{backend::NdArray, tensor::activation::softmax};
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_all_zero_weights_are_rejected() {
        match PairwiseCostEngine::new(0.0, 0.0, 0.0, 16) {
            Err(OneFormerError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("can't be 0"));
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }

        assert!(PairwiseCostEngine::new(-1.0, 1.0, 1.0, 16).is_err());
        assert!(PairwiseCostEngine::new(0.0, 0.0, 1.0, 16).is_ok());
    }

    #[test]
    fn test_pairwise_losses_agree_with_per_pair_losses() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.5, -1.0, 2.0, 0.0], [-3.0, 1.5, 0.2, -0.7], [1.0, 1.0, -1.0, 4.0]],
            &device,
        );
        let labels = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, 0.0, 1.0, 0.0], [0.0, 1.0, 1.0, 1.0]],
            &device,
        );

        let ce = pairwise_sigmoid_ce_loss(logits.clone(), labels.clone())
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let dice = pairwise_dice_loss(logits.clone(), labels.clone())
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        for q in 0..3 {
            for t in 0..2 {
                let logit = logits.clone().slice([q..q + 1, 0..4]);
                let label = labels.clone().slice([t..t + 1, 0..4]);

                let expected_ce: f32 = sigmoid_ce_loss(logit.clone(), label.clone(), 1.0)
                    .unwrap()
                    .into_scalar();
                let expected_dice: f32 = dice_loss(logit, label, 1.0).unwrap().into_scalar();

                assert!((ce[q * 2 + t] - expected_ce).abs() < 1e-5);
                assert!((dice[q * 2 + t] - expected_dice).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_class_cost_is_negative_probability() {
        let device = Default::default();
        let engine = PairwiseCostEngine::new(1.0, 0.0, 0.0, 8).unwrap();
        let probs = softmax(
            Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0, 0.0], [0.0, 3.0, 0.0]], &device),
            1,
        );
        let masks = Tensor::<TestBackend, 3>::zeros([2, 4, 4], &device);
        let targets = Tensor::<TestBackend, 3>::ones([2, 8, 8], &device);

        let cost = engine
            .compute(probs.clone(), masks, targets, &[1, 0], &mut StdRng::seed_from_u64(1))
            .unwrap();
        let probs = probs.into_data().to_vec::<f32>().unwrap();

        assert_eq!((cost.rows(), cost.cols()), (2, 2));
        assert!((cost.get(0, 0) + f64::from(probs[1])).abs() < 1e-6);
        assert!((cost.get(0, 1) + f64::from(probs[0])).abs() < 1e-6);
        assert!((cost.get(1, 0) + f64::from(probs[4])).abs() < 1e-6);
        assert!((cost.get(1, 1) + f64::from(probs[3])).abs() < 1e-6);
    }

    #[test]
    fn test_image_without_targets_has_empty_costs() {
        let device = Default::default();
        let engine = PairwiseCostEngine::new(2.0, 5.0, 5.0, 8).unwrap();
        let probs = Tensor::<TestBackend, 2>::ones([3, 4], &device);
        let masks = Tensor::<TestBackend, 3>::zeros([3, 4, 4], &device);
        let targets = Tensor::<TestBackend, 3>::zeros([0, 4, 4], &device);

        let cost = engine
            .compute(probs, masks, targets, &[], &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!((cost.rows(), cost.cols()), (3, 0));
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let device = Default::default();
        let engine = PairwiseCostEngine::new(2.0, 5.0, 5.0, 8).unwrap();
        let probs = Tensor::<TestBackend, 2>::ones([3, 4], &device);
        let targets = Tensor::<TestBackend, 3>::zeros([2, 4, 4], &device);

        let wrong_queries = engine.compute(
            probs.clone(),
            Tensor::<TestBackend, 3>::zeros([2, 4, 4], &device),
            targets.clone(),
            &[0, 1],
            &mut StdRng::seed_from_u64(1),
        );
        assert!(matches!(wrong_queries, Err(OneFormerError::ShapeMismatch { .. })));

        let masks_without_labels = engine.compute(
            probs.clone(),
            Tensor::<TestBackend, 3>::zeros([3, 4, 4], &device),
            targets.clone(),
            &[],
            &mut StdRng::seed_from_u64(1),
        );
        match masks_without_labels {
            Err(OneFormerError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, "0 target masks");
                assert_eq!(actual, "2 target masks");
            }
            other => panic!("Expected ShapeMismatch error, got {other:?}"),
        }

        let no_object_label = engine.compute(
            probs,
            Tensor::<TestBackend, 3>::zeros([3, 4, 4], &device),
            targets,
            &[0, 3],
            &mut StdRng::seed_from_u64(1),
        );
        assert!(matches!(no_object_label, Err(OneFormerError::ShapeMismatch { .. })));
    }
}
