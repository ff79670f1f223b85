//! Optimal one-to-one assignment of predictions to ground-truth objects.

use burn::{prelude::*, tensor::activation::softmax};
use lapjv::{lapjv, Matrix};
use rand::Rng;
use tracing::debug;

use super::cost::{CostMatrix, PairwiseCostEngine};
use crate::{
    error::{OneFormerError, OneFormerResult},
    target::SegmentationTarget,
};

/// Matched `(query, target)` pairs of one image, sorted by query index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchIndices {
    /// Matched prediction indices.
    pub queries: Vec<usize>,
    /// Target index matched to each entry of `queries`.
    pub targets: Vec<usize>,
}

impl MatchIndices {
    /// Number of matched pairs.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// `true` if nothing was matched.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Iterates over `(query, target)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.queries.iter().copied().zip(self.targets.iter().copied())
    }

    /// Sum of the matched entries of `cost`.
    pub fn total_cost(&self, cost: &CostMatrix) -> f64 {
        self.pairs().map(|(query, target)| cost.get(query, target)).sum()
    }
}

/// Solves the rectangular linear assignment problem exactly.
///
/// The matrix is padded to a square with a constant, solved with the
/// Jonker-Volgenant algorithm, and pairs that involve padding are dropped, leaving
/// `min(rows, cols)` pairs.
///
/// # Errors
///
/// Returns `Err(OneFormerError::AssignmentFailed)` if the matrix holds a non-finite
/// cost or the solver fails.
pub fn linear_sum_assignment(cost: &CostMatrix) -> OneFormerResult<MatchIndices> {
    let (rows, cols) = (cost.rows(), cost.cols());
    if rows == 0 || cols == 0 {
        return Ok(MatchIndices::default());
    }

    if let Some(value) = cost.values().iter().find(|value| !value.is_finite()) {
        return Err(OneFormerError::AssignmentFailed {
            reason: format!("cost matrix contains a non-finite value ({value})"),
        });
    }

    let size = rows.max(cols);
    let mut padded = vec![0.0; size * size];
    for row in 0..rows {
        padded[row * size..row * size + cols].copy_from_slice(cost.row(row));
    }

    let matrix = Matrix::from_shape_vec((size, size), padded).map_err(|err| {
        OneFormerError::AssignmentFailed {
            reason: format!("could not build a {size}x{size} matrix: {err}"),
        }
    })?;
    let (row_to_col, _) = lapjv(&matrix).map_err(|err| OneFormerError::AssignmentFailed {
        reason: format!("{err:?}"),
    })?;

    let (queries, targets): (Vec<usize>, Vec<usize>) = row_to_col
        .iter()
        .take(rows)
        .enumerate()
        .filter(|(_, col)| **col < cols)
        .map(|(row, col)| (row, *col))
        .unzip();

    Ok(MatchIndices { queries, targets })
}

/// Configuration of the [`HungarianMatcher`].
#[derive(Config, Debug)]
pub struct HungarianMatcherConfig {
    /// Weight of the classification cost.
    #[config(default = 2.0)]
    pub class_weight: f64,
    /// Weight of the sigmoid cross-entropy mask cost.
    #[config(default = 5.0)]
    pub mask_weight: f64,
    /// Weight of the dice mask cost.
    #[config(default = 5.0)]
    pub dice_weight: f64,
    /// Points sampled per image to estimate the mask costs.
    #[config(default = 12544)]
    pub num_points: usize,
}

impl HungarianMatcherConfig {
    /// Build the matcher.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if all weights are zero,
    /// a weight is negative, or `num_points` is zero.
    pub fn init(&self) -> OneFormerResult<HungarianMatcher> {
        Ok(HungarianMatcher {
            cost: PairwiseCostEngine::new(
                self.class_weight,
                self.mask_weight,
                self.dice_weight,
                self.num_points,
            )?,
        })
    }
}

/// Matches the predictions of every image to its ground truth.
///
/// Matching is a discrete decision: all inputs are detached and no gradient flows
/// through it.
#[derive(Debug, Clone)]
pub struct HungarianMatcher {
    cost: PairwiseCostEngine,
}

impl HungarianMatcher {
    /// Cost engine used to score every pair.
    pub const fn cost_engine(&self) -> &PairwiseCostEngine {
        &self.cost
    }

    /// Performs the matching.
    ///
    /// # Arguments
    /// * `mask_logits` - Predicted masks, `[batch, queries, height, width]`
    /// * `class_logits` - Predicted class logits, `[batch, queries, num_classes + 1]`
    /// * `targets` - Ground truth of each image
    /// * `rng` - Source of the sampled point coordinates
    ///
    /// # Returns
    /// One [`MatchIndices`] per image with `min(queries, targets)` pairs; images
    /// without targets get an empty match.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` for inconsistent batch or query
    /// counts and `Err(OneFormerError::AssignmentFailed)` if a cost matrix can't be solved.
    pub fn forward<B: Backend, R: Rng>(
        &self,
        mask_logits: Tensor<B, 4>,
        class_logits: Tensor<B, 3>,
        targets: &[SegmentationTarget<B>],
        rng: &mut R,
    ) -> OneFormerResult<Vec<MatchIndices>> {
        let [batch, queries, classes] = class_logits.dims();
        let [mask_batch, mask_queries, height, width] = mask_logits.dims();

        if mask_batch != batch || mask_queries != queries {
            return Err(OneFormerError::shape_mismatch(
                format!("masks for {batch} images with {queries} queries"),
                format!("{mask_batch} images with {mask_queries} queries"),
            ));
        }
        if targets.len() != batch {
            return Err(OneFormerError::shape_mismatch(
                format!("targets for {batch} images"),
                format!("{} targets", targets.len()),
            ));
        }

        let probs = softmax(class_logits.detach(), 2);
        let mask_logits = mask_logits.detach();

        let mut indices = Vec::with_capacity(batch);
        for (index, target) in targets.iter().enumerate() {
            let Some(target_masks) = target.masks() else {
                indices.push(MatchIndices::default());
                continue;
            };

            let image_probs = probs
                .clone()
                .slice([index..index + 1, 0..queries, 0..classes])
                .reshape([queries, classes]);
            let image_masks = mask_logits
                .clone()
                .slice([index..index + 1, 0..queries, 0..height, 0..width])
                .reshape([queries, height, width]);

            let cost = self.cost.compute(
                image_probs,
                image_masks,
                target_masks.clone().detach(),
                target.labels(),
                rng,
            )?;
            indices.push(linear_sum_assignment(&cost)?);
        }

        debug!(
            batch,
            matched = indices.iter().map(MatchIndices::len).sum::<usize>(),
            "matched predictions to targets"
        );

        Ok(indices)
    }
}
