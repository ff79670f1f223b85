//! Set-prediction criterion.
//!
//! For every supervised decoder layer the criterion:
//!
//! 1. matches queries to ground-truth objects with the [`HungarianMatcher`],
//! 2. classifies every query, unmatched queries against the no-object class,
//! 3. scores matched masks at uncertainty-sampled points with sigmoid
//!    cross-entropy and dice, normalized by the number of ground-truth masks,
//! 4. on the final layer only, adds the query-text contrastive term.
//!
//! Auxiliary layers are supervised the same way and their terms are suffixed with
//! the layer index (`loss_mask_0`, `loss_dice_0`, ...).

use burn::{module::Ignored, prelude::*};
use rand::Rng;
use tracing::{debug, warn};

use super::{
    classification::{ClassificationLoss, ClassificationLossConfig},
    contrastive::{ContrastiveLoss, ContrastiveLossConfig},
    mask::{dice_loss, sigmoid_ce_loss},
    LossMap, LOSS_CONTRASTIVE, LOSS_CROSS_ENTROPY, LOSS_DICE, LOSS_MASK,
};
use crate::{
    error::{OneFormerError, OneFormerResult},
    matcher::{HungarianMatcher, HungarianMatcherConfig, MatchIndices},
    sampling::{point_sample, UncertaintySampler, UncertaintySamplerConfig},
    target::{PaddedTargets, SegmentationTarget},
};

/// Configuration of the [`SetCriterion`].
#[derive(Config, Debug)]
pub struct SetCriterionConfig {
    /// Number of real classes, excluding the no-object class.
    pub num_classes: usize,
    /// Weight of the classification matching cost.
    #[config(default = 2.0)]
    pub class_weight: f64,
    /// Weight of the sigmoid cross-entropy matching cost.
    #[config(default = 5.0)]
    pub mask_weight: f64,
    /// Weight of the dice matching cost.
    #[config(default = 5.0)]
    pub dice_weight: f64,
    /// Classification weight of the no-object class.
    #[config(default = 0.1)]
    pub no_object_weight: f64,
    /// Initial contrastive temperature. `None` disables the contrastive term.
    #[config(default = "Some(0.07)")]
    pub contrastive_temperature: Option<f64>,
    /// Points sampled per mask for matching and for the mask losses.
    #[config(default = 12544)]
    pub num_points: usize,
    /// Candidate points drawn per sampled point.
    #[config(default = 3.0)]
    pub oversample_ratio: f64,
    /// Fraction of the sampled points chosen by uncertainty.
    #[config(default = 0.75)]
    pub importance_sample_ratio: f64,
    /// Supervise auxiliary decoder layers when they are supplied.
    #[config(default = "true")]
    pub use_auxiliary_loss: bool,
}

impl SetCriterionConfig {
    /// Build the criterion.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if all matching weights are
    /// zero, a sampling ratio is out of range or the temperature is not positive.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OneFormerResult<SetCriterion<B>> {
        if self.num_classes == 0 {
            return Err(OneFormerError::invalid_configuration(
                "num_classes must be at least 1",
            ));
        }
        if !self.no_object_weight.is_finite() || self.no_object_weight < 0.0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "no_object_weight must be finite and non-negative, got {}",
                    self.no_object_weight
                ),
            });
        }

        let matcher = HungarianMatcherConfig::new()
            .with_class_weight(self.class_weight)
            .with_mask_weight(self.mask_weight)
            .with_dice_weight(self.dice_weight)
            .with_num_points(self.num_points)
            .init()?;
        let sampler = UncertaintySamplerConfig::new(self.num_points)
            .with_oversample_ratio(self.oversample_ratio)
            .with_importance_sample_ratio(self.importance_sample_ratio)
            .init()?;
        let contrastive = self
            .contrastive_temperature
            .map(|temperature| {
                ContrastiveLossConfig::new()
                    .with_temperature(temperature)
                    .init(device)
            })
            .transpose()?;

        Ok(SetCriterion {
            num_classes: self.num_classes,
            use_auxiliary_loss: self.use_auxiliary_loss,
            classification: ClassificationLossConfig::new(self.num_classes)
                .with_no_object_weight(self.no_object_weight)
                .init(device),
            contrastive,
            matcher: Ignored(matcher),
            sampler: Ignored(sampler),
        })
    }
}

/// Outputs of one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerPredictions<B: Backend> {
    /// Mask logits, `[batch, queries, height, width]`.
    pub mask_logits: Tensor<B, 4>,
    /// Class logits, `[batch, queries, num_classes + 1]`.
    pub class_logits: Tensor<B, 3>,
}

/// Embeddings compared by the contrastive term.
#[derive(Debug, Clone)]
pub struct ContrastiveInputs<B: Backend> {
    /// Task-conditioned query embeddings, `[batch, queries, dim]`.
    pub image_queries: Tensor<B, 3>,
    /// Text query embeddings, `[batch, queries, dim]`.
    pub text_queries: Tensor<B, 3>,
}

/// Matches predictions to ground truth and computes the named loss terms.
#[derive(Module, Debug)]
pub struct SetCriterion<B: Backend> {
    pub num_classes: usize,
    pub use_auxiliary_loss: bool,
    pub classification: ClassificationLoss<B>,
    pub contrastive: Option<ContrastiveLoss<B>>,
    matcher: Ignored<HungarianMatcher>,
    sampler: Ignored<UncertaintySampler>,
}

impl<B: Backend> SetCriterion<B> {
    /// The matcher used for every supervised layer.
    pub fn matcher(&self) -> &HungarianMatcher {
        &self.matcher
    }

    /// The point sampler used by the mask losses.
    pub fn sampler(&self) -> &UncertaintySampler {
        &self.sampler
    }

    /// Computes every loss term.
    ///
    /// # Arguments
    /// * `predictions` - Outputs of the last decoder layer
    /// * `contrastive` - Embeddings for the contrastive term; `None` skips it. It is
    ///   also skipped when the criterion was built without a temperature.
    /// * `targets` - Ground truth of each image
    /// * `auxiliary` - Outputs of the intermediate decoder layers, in layer order
    /// * `rng` - Source of every sampled point
    ///
    /// # Returns
    /// `loss_cross_entropy`, `loss_mask`, `loss_dice`, optionally `loss_contrastive`,
    /// plus the first three suffixed with `_<layer>` for every auxiliary layer.
    ///
    /// When the batch holds no ground-truth object at all, the mask normalizer is
    /// clamped to 1 and `loss_mask` and `loss_dice` are zero.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` for inconsistent inputs and
    /// `Err(OneFormerError::AssignmentFailed)` if matching fails.
    pub fn forward<R: Rng>(
        &self,
        predictions: &LayerPredictions<B>,
        contrastive: Option<&ContrastiveInputs<B>>,
        targets: &[SegmentationTarget<B>],
        auxiliary: &[LayerPredictions<B>],
        rng: &mut R,
    ) -> OneFormerResult<LossMap<B>> {
        let device = predictions.class_logits.device();
        let num_masks = self.num_masks(targets);
        let padded = PaddedTargets::from_targets(targets, &device);

        let mut losses = self.layer_losses(predictions, targets, padded.as_ref(), num_masks, rng)?;

        match (contrastive, &self.contrastive) {
            (Some(inputs), Some(loss)) => {
                let value = loss.forward(inputs.image_queries.clone(), inputs.text_queries.clone())?;
                losses.insert(LOSS_CONTRASTIVE.to_string(), value);
            }
            (Some(_), None) => debug!("no contrastive temperature configured, skipping contrastive loss"),
            _ => {}
        }

        if self.use_auxiliary_loss {
            for (layer, outputs) in auxiliary.iter().enumerate() {
                let layer_losses = self.layer_losses(outputs, targets, padded.as_ref(), num_masks, rng)?;
                losses.extend(
                    layer_losses
                        .into_iter()
                        .map(|(key, value)| (format!("{key}_{layer}"), value)),
                );
            }
        } else if !auxiliary.is_empty() {
            debug!(layers = auxiliary.len(), "auxiliary loss disabled, ignoring auxiliary layers");
        }

        debug!(
            num_masks,
            terms = losses.len(),
            keys = ?losses.keys().collect::<Vec<_>>(),
            "computed set criterion losses"
        );

        Ok(losses)
    }

    /// Total number of ground-truth objects in the batch, clamped to at least 1.
    pub fn num_masks(&self, targets: &[SegmentationTarget<B>]) -> f64 {
        let total: usize = targets.iter().map(SegmentationTarget::len).sum();
        if total == 0 {
            warn!("batch has no ground-truth objects, clamping the mask loss normalizer to 1");
            return 1.0;
        }
        total as f64
    }

    /// Target class of every query: the matched label, or the no-object class.
    ///
    /// Returned row-major as `[batch, queries]`.
    pub fn target_classes(
        &self,
        queries: usize,
        targets: &[SegmentationTarget<B>],
        indices: &[MatchIndices],
    ) -> Vec<usize> {
        let mut classes = vec![self.num_classes; targets.len() * queries];
        for (image, (target, matched)) in targets.iter().zip(indices).enumerate() {
            for (query, object) in matched.pairs() {
                classes[image * queries + query] = target.labels()[object];
            }
        }
        classes
    }

    fn layer_losses<R: Rng>(
        &self,
        predictions: &LayerPredictions<B>,
        targets: &[SegmentationTarget<B>],
        padded: Option<&PaddedTargets<B>>,
        num_masks: f64,
        rng: &mut R,
    ) -> OneFormerResult<LossMap<B>> {
        let indices = self.matcher.forward(
            predictions.mask_logits.clone(),
            predictions.class_logits.clone(),
            targets,
            rng,
        )?;

        let mut losses = LossMap::new();
        losses.insert(
            LOSS_CROSS_ENTROPY.to_string(),
            self.loss_labels(predictions.class_logits.clone(), targets, &indices)?,
        );

        let (loss_mask, loss_dice) =
            self.loss_masks(predictions.mask_logits.clone(), padded, &indices, num_masks, rng)?;
        losses.insert(LOSS_MASK.to_string(), loss_mask);
        losses.insert(LOSS_DICE.to_string(), loss_dice);

        Ok(losses)
    }

    fn loss_labels(
        &self,
        class_logits: Tensor<B, 3>,
        targets: &[SegmentationTarget<B>],
        indices: &[MatchIndices],
    ) -> OneFormerResult<Tensor<B, 1>> {
        let [batch, queries, _] = class_logits.dims();
        let device = class_logits.device();

        let classes = self
            .target_classes(queries, targets, indices)
            .into_iter()
            .map(|class| class as i64)
            .collect::<Vec<_>>();
        let classes = Tensor::<B, 2, Int>::from_data(TensorData::new(classes, [batch, queries]), &device);

        self.classification.forward(class_logits, classes)
    }

    fn loss_masks<R: Rng>(
        &self,
        mask_logits: Tensor<B, 4>,
        padded: Option<&PaddedTargets<B>>,
        indices: &[MatchIndices],
        num_masks: f64,
        rng: &mut R,
    ) -> OneFormerResult<(Tensor<B, 1>, Tensor<B, 1>)> {
        let [batch, queries, height, width] = mask_logits.dims();
        let device = mask_logits.device();

        let matched: usize = indices.iter().map(MatchIndices::len).sum();
        let Some(padded) = padded.filter(|_| matched > 0) else {
            return Ok((Tensor::zeros([1], &device), Tensor::zeros([1], &device)));
        };

        let [_, max_objects, target_height, target_width] = padded.masks.dims();
        let mut src = Vec::with_capacity(matched);
        let mut tgt = Vec::with_capacity(matched);
        for (image, pairs) in indices.iter().enumerate() {
            for (query, object) in pairs.pairs() {
                src.push((image * queries + query) as i64);
                tgt.push((image * max_objects + object) as i64);
            }
        }
        let src = Tensor::<B, 1, Int>::from_data(TensorData::new(src, [matched]), &device);
        let tgt = Tensor::<B, 1, Int>::from_data(TensorData::new(tgt, [matched]), &device);

        let pred_masks = mask_logits
            .reshape([batch * queries, height, width])
            .select(0, src)
            .reshape([matched, 1, height, width]);
        let target_masks = padded
            .masks
            .clone()
            .reshape([batch * max_objects, target_height, target_width])
            .select(0, tgt)
            .reshape([matched, 1, target_height, target_width]);

        let coords = self.sampler.sample(pred_masks.clone().detach(), rng)?;
        let points = coords.dims()[1];

        let point_labels = point_sample(target_masks.detach(), coords.clone())?
            .reshape([matched, points])
            .detach();
        let point_logits = point_sample(pred_masks, coords)?.reshape([matched, points]);

        Ok((
            sigmoid_ce_loss(point_logits.clone(), point_labels.clone(), num_masks)?,
            dice_loss(point_logits, point_labels, num_masks)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    const NUM_CLASSES: usize = 3;

    fn square_mask(top: usize, left: usize) -> Vec<f32> {
        (0..64)
            .map(|i| {
                let (row, col) = (i / 8, i % 8);
                if (top..top + 4).contains(&row) && (left..left + 4).contains(&col) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn two_image_batch<B: Backend>(device: &B::Device) -> Vec<SegmentationTarget<B>> {
        let mut data = square_mask(0, 0);
        data.extend(square_mask(4, 4));
        let masks = Tensor::<B, 3>::from_data(TensorData::new(data, [2, 8, 8]), device);

        vec![
            SegmentationTarget::new(masks, vec![2, 0]).unwrap(),
            SegmentationTarget::empty(8, 8),
        ]
    }

    fn predictions<B: Backend>(device: &B::Device) -> LayerPredictions<B> {
        LayerPredictions {
            mask_logits: Tensor::random(
                [2, 5, 4, 4],
                burn::tensor::Distribution::Normal(0.0, 1.0),
                device,
            ),
            class_logits: Tensor::random(
                [2, 5, NUM_CLASSES + 1],
                burn::tensor::Distribution::Normal(0.0, 1.0),
                device,
            ),
        }
    }

    fn criterion<B: Backend>(temperature: Option<f64>, device: &B::Device) -> SetCriterion<B> {
        SetCriterionConfig::new(NUM_CLASSES)
            .with_num_points(32)
            .with_contrastive_temperature(temperature)
            .init(device)
            .unwrap()
    }

    #[test]
    fn test_two_images_with_two_and_zero_targets() {
        let device = Default::default();
        let criterion = criterion::<TestBackend>(Some(0.07), &device);
        let targets = two_image_batch::<TestBackend>(&device);
        let predictions = predictions::<TestBackend>(&device);
        let contrastive = ContrastiveInputs {
            image_queries: Tensor::random([2, 5, 6], burn::tensor::Distribution::Default, &device),
            text_queries: Tensor::random([2, 5, 6], burn::tensor::Distribution::Default, &device),
        };
        let mut rng = StdRng::seed_from_u64(5);

        assert_eq!(criterion.num_masks(&targets), 2.0);

        let indices = criterion
            .matcher()
            .forward(
                predictions.mask_logits.clone(),
                predictions.class_logits.clone(),
                &targets,
                &mut rng,
            )
            .unwrap();
        assert_eq!(indices[0].len(), 2);
        assert!(indices[1].is_empty());

        let classes = criterion.target_classes(5, &targets, &indices);
        assert_eq!(classes.len(), 10);
        assert_eq!(classes.iter().filter(|c| **c != NUM_CLASSES).count(), 2);
        let mut labels: Vec<usize> = classes.iter().copied().filter(|c| *c != NUM_CLASSES).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec![0, 2]);
        assert!(classes[5..].iter().all(|c| *c == NUM_CLASSES));

        let losses = criterion
            .forward(&predictions, Some(&contrastive), &targets, &[], &mut rng)
            .unwrap();
        let keys: Vec<&str> = losses.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["loss_contrastive", "loss_cross_entropy", "loss_dice", "loss_mask"]
        );
        for loss in losses.values() {
            let value: f32 = loss.clone().into_scalar();
            assert!(value.is_finite() && value >= 0.0);
        }
    }

    #[test]
    fn test_mask_losses_use_batch_object_count() {
        let device = Default::default();
        let criterion = criterion::<TestBackend>(None, &device);
        let targets = two_image_batch::<TestBackend>(&device);

        // Perfect, confident masks: query 0 covers the first square, query 1 the second.
        let mut logits = Vec::with_capacity(2 * 5 * 16);
        for image in 0..2 {
            for query in 0..5 {
                for i in 0..16 {
                    let (row, col) = (i / 4, i % 4);
                    let inside = match (image, query) {
                        (0, 0) => row < 2 && col < 2,
                        (0, 1) => row >= 2 && col >= 2,
                        _ => false,
                    };
                    logits.push(if inside { 40.0 } else { -40.0 });
                }
            }
        }
        let mut classes = vec![0.0f32; 2 * 5 * (NUM_CLASSES + 1)];
        for query in 0..10 {
            let class = match query {
                0 => 2,
                1 => 0,
                _ => NUM_CLASSES,
            };
            classes[query * (NUM_CLASSES + 1) + class] = 40.0;
        }
        let predictions = LayerPredictions {
            mask_logits: Tensor::<TestBackend, 4>::from_data(TensorData::new(logits, [2, 5, 4, 4]), &device),
            class_logits: Tensor::<TestBackend, 3>::from_data(
                TensorData::new(classes, [2, 5, NUM_CLASSES + 1]),
                &device,
            ),
        };

        let losses = criterion
            .forward(&predictions, None, &targets, &[], &mut StdRng::seed_from_u64(9))
            .unwrap();

        assert!(!losses.contains_key("loss_contrastive"));
        let ce: f32 = losses["loss_cross_entropy"].clone().into_scalar();
        let dice: f32 = losses["loss_dice"].clone().into_scalar();
        assert!(ce < 1e-4, "got {ce}");
        // Saturated logits against bilinearly sampled labels: only points within half
        // a target texel of a square's edge disagree.
        assert!(dice < 0.3, "got {dice}");
    }

    #[test]
    fn test_auxiliary_layers_are_suffixed_without_contrastive() {
        let device = Default::default();
        let criterion = criterion::<TestBackend>(Some(0.07), &device);
        let targets = two_image_batch::<TestBackend>(&device);
        let contrastive = ContrastiveInputs {
            image_queries: Tensor::random([2, 5, 4], burn::tensor::Distribution::Default, &device),
            text_queries: Tensor::random([2, 5, 4], burn::tensor::Distribution::Default, &device),
        };
        let auxiliary = vec![predictions(&device), predictions(&device)];

        let losses = criterion
            .forward(
                &predictions(&device),
                Some(&contrastive),
                &targets,
                &auxiliary,
                &mut StdRng::seed_from_u64(1),
            )
            .unwrap();

        assert_eq!(losses.len(), 4 + 2 * 3);
        for layer in 0..2 {
            for base in ["loss_cross_entropy", "loss_mask", "loss_dice"] {
                assert!(losses.contains_key(&format!("{base}_{layer}")));
            }
            assert!(!losses.contains_key(&format!("loss_contrastive_{layer}")));
        }
    }

    #[test]
    fn test_batch_without_objects_is_guarded() {
        let device = Default::default();
        let criterion = criterion::<TestBackend>(None, &device);
        let targets = vec![
            SegmentationTarget::<TestBackend>::empty(8, 8),
            SegmentationTarget::empty(8, 8),
        ];

        assert_eq!(criterion.num_masks(&targets), 1.0);

        let losses = criterion
            .forward(&predictions(&device), None, &targets, &[], &mut StdRng::seed_from_u64(2))
            .unwrap();
        let mask: f32 = losses["loss_mask"].clone().into_scalar();
        let dice: f32 = losses["loss_dice"].clone().into_scalar();
        let ce: f32 = losses["loss_cross_entropy"].clone().into_scalar();
        assert_eq!(mask, 0.0);
        assert_eq!(dice, 0.0);
        assert!(ce.is_finite());
    }

    #[test]
    fn test_same_seed_same_losses() {
        let device = Default::default();
        let criterion = criterion::<TestBackend>(None, &device);
        let targets = two_image_batch::<TestBackend>(&device);
        let predictions = predictions::<TestBackend>(&device);

        let first = criterion
            .forward(&predictions, None, &targets, &[], &mut StdRng::seed_from_u64(4))
            .unwrap();
        let second = criterion
            .forward(&predictions, None, &targets, &[], &mut StdRng::seed_from_u64(4))
            .unwrap();

        for (key, value) in &first {
            let a: f32 = value.clone().into_scalar();
            let b: f32 = second[key].clone().into_scalar();
            assert_eq!(a, b, "{key} differs between identical runs");
        }
    }

    #[test]
    fn test_gradients_reach_mask_and_class_logits() {
        let device = Default::default();
        let criterion = criterion::<TestAutodiffBackend>(None, &device);
        let targets = two_image_batch::<TestAutodiffBackend>(&device);
        let base = predictions::<TestAutodiffBackend>(&device);
        let predictions = LayerPredictions {
            mask_logits: base.mask_logits.require_grad(),
            class_logits: base.class_logits.require_grad(),
        };

        let losses = criterion
            .forward(&predictions, None, &targets, &[], &mut StdRng::seed_from_u64(3))
            .unwrap();
        let total = losses
            .into_values()
            .fold(Tensor::zeros([1], &device), |total, loss| total + loss);
        let grads = total.backward();

        let mask_grad = predictions.mask_logits.grad(&grads).expect("mask gradient");
        let class_grad = predictions.class_logits.grad(&grads).expect("class gradient");
        let mask_norm: f32 = mask_grad.abs().sum().into_scalar();
        let class_norm: f32 = class_grad.abs().sum().into_scalar();
        assert!(mask_norm > 0.0);
        assert!(class_norm > 0.0);
    }
}
