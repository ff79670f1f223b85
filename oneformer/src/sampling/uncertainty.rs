//! Uncertainty-driven point selection.
//!
//! Mask losses are estimated on a sparse set of points. Most of the budget goes to
//! points whose logits sit closest to the decision boundary, measured on
//! point-sampled logits of an oversampled candidate pool; the rest is filled with
//! fresh uniform points so the loss keeps seeing easy regions too.

use burn::prelude::*;
use rand::Rng;

use super::point::point_sample;
use crate::{
    error::{OneFormerError, OneFormerResult},
    host::{to_host_f32, uniform_coords},
};

/// Configuration of the [`UncertaintySampler`].
#[derive(Config, Debug)]
pub struct UncertaintySamplerConfig {
    /// Points returned per mask.
    pub num_points: usize,
    /// Candidates drawn per returned point. Must be at least 1.
    #[config(default = 3.0)]
    pub oversample_ratio: f64,
    /// Fraction of the returned points picked by uncertainty. Must be in `[0, 1]`.
    #[config(default = 0.75)]
    pub importance_sample_ratio: f64,
}

impl UncertaintySamplerConfig {
    /// Build the sampler.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if `oversample_ratio < 1`
    /// or `importance_sample_ratio` lies outside `[0, 1]`.
    pub fn init(&self) -> OneFormerResult<UncertaintySampler> {
        if self.oversample_ratio.is_nan() || self.oversample_ratio < 1.0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "oversample_ratio must be >= 1, got {}",
                    self.oversample_ratio
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.importance_sample_ratio) {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "importance_sample_ratio must be in [0, 1], got {}",
                    self.importance_sample_ratio
                ),
            });
        }

        let num_candidates = (self.num_points as f64 * self.oversample_ratio) as usize;
        let num_uncertain = (self.importance_sample_ratio * self.num_points as f64) as usize;

        Ok(UncertaintySampler {
            num_points: self.num_points,
            num_candidates: num_candidates.max(num_uncertain),
            num_uncertain,
        })
    }
}

/// Selects point coordinates biased toward uncertain regions of mask logits.
#[derive(Debug, Clone)]
pub struct UncertaintySampler {
    num_points: usize,
    num_candidates: usize,
    num_uncertain: usize,
}

impl UncertaintySampler {
    /// Points returned per mask.
    pub const fn num_points(&self) -> usize {
        self.num_points
    }

    /// Size of the candidate pool drawn per mask.
    pub const fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    /// Points per mask chosen by uncertainty rather than drawn at random.
    pub const fn num_uncertain(&self) -> usize {
        self.num_uncertain
    }

    /// Draws `num_points` coordinates per mask.
    ///
    /// The first `num_uncertain` points of each row are the most uncertain
    /// candidates, most uncertain first, ties going to the earlier candidate. The
    /// remaining points are fresh uniform draws. No gradient flows into the
    /// returned coordinates.
    ///
    /// # Shapes
    /// - logits: `[masks, 1, height, width]`
    /// - output: `[masks, num_points, 2]`, `(x, y)` pairs in `[0, 1)`
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if `logits` has more than one channel.
    pub fn sample<B: Backend, R: Rng>(
        &self,
        logits: Tensor<B, 4>,
        rng: &mut R,
    ) -> OneFormerResult<Tensor<B, 3>> {
        let [masks, channels, _, _] = logits.dims();
        let device = logits.device();

        if channels != 1 {
            return Err(OneFormerError::shape_mismatch(
                "class-agnostic logits with 1 channel",
                format!("{channels} channels"),
            ));
        }
        if masks == 0 || self.num_points == 0 {
            return Ok(Tensor::zeros([masks, self.num_points, 2], &device));
        }

        let candidates = uniform_coords(rng, masks * self.num_candidates * 2);
        let candidate_coords = Tensor::<B, 3>::from_data(
            TensorData::new(candidates.clone(), [masks, self.num_candidates, 2]),
            &device,
        );

        let point_logits = point_sample(logits.detach(), candidate_coords)?;
        let scores = to_host_f32(uncertainty(point_logits), "read point uncertainty")?;

        let num_random = self.num_points - self.num_uncertain;
        let fill = uniform_coords(rng, masks * num_random * 2);

        let mut coords = Vec::with_capacity(masks * self.num_points * 2);
        let mut order: Vec<usize> = Vec::with_capacity(self.num_candidates);
        for mask in 0..masks {
            let mask_scores = &scores[mask * self.num_candidates..(mask + 1) * self.num_candidates];
            let mask_candidates =
                &candidates[mask * self.num_candidates * 2..(mask + 1) * self.num_candidates * 2];

            order.clear();
            order.extend(0..self.num_candidates);
            order.sort_by(|&a, &b| mask_scores[b].total_cmp(&mask_scores[a]));

            for &index in &order[..self.num_uncertain] {
                coords.extend_from_slice(&mask_candidates[index * 2..index * 2 + 2]);
            }
            coords.extend_from_slice(&fill[mask * num_random * 2..(mask + 1) * num_random * 2]);
        }

        Ok(Tensor::from_data(
            TensorData::new(coords, [masks, self.num_points, 2]),
            &device,
        ))
    }
}

/// Uncertainty of class-agnostic logits: `-|logit|`, highest at the decision boundary.
pub fn uncertainty<B: Backend, const D: usize>(logits: Tensor<B, D>) -> Tensor<B, D> {
    logits.abs().neg()
}
