//! Weighting of the named loss terms into one training objective.

use burn::prelude::*;

use super::{LossMap, LOSS_CONTRASTIVE, LOSS_CROSS_ENTROPY, LOSS_DICE, LOSS_MASK};

/// Per-term loss weights.
///
/// Auxiliary copies of a term (`loss_dice_3`, ...) share the weight of the term.
#[derive(Config, Debug, PartialEq)]
pub struct LossWeights {
    /// Weight of `loss_cross_entropy`.
    #[config(default = 2.0)]
    pub class_weight: f64,
    /// Weight of `loss_mask`.
    #[config(default = 5.0)]
    pub mask_weight: f64,
    /// Weight of `loss_dice`.
    #[config(default = 5.0)]
    pub dice_weight: f64,
    /// Weight of `loss_contrastive`.
    #[config(default = 0.5)]
    pub contrastive_weight: f64,
}

impl LossWeights {
    /// Weight of a loss key, or `None` for keys that are not a known term.
    pub fn weight_for(&self, key: &str) -> Option<f64> {
        let base = match key.rsplit_once('_') {
            Some((base, layer)) if layer.parse::<usize>().is_ok() => base,
            _ => key,
        };

        match base {
            LOSS_CROSS_ENTROPY => Some(self.class_weight),
            LOSS_MASK => Some(self.mask_weight),
            LOSS_DICE => Some(self.dice_weight),
            LOSS_CONTRASTIVE => Some(self.contrastive_weight),
            _ => None,
        }
    }

    /// Scales every known term by its weight. Unknown keys pass through unchanged.
    pub fn apply<B: Backend>(&self, losses: LossMap<B>) -> LossMap<B> {
        losses
            .into_iter()
            .map(|(key, loss)| match self.weight_for(&key) {
                Some(weight) => (key, loss * weight),
                None => (key, loss),
            })
            .collect()
    }

    /// Sum of the weighted terms.
    pub fn total<B: Backend>(&self, losses: &LossMap<B>, device: &B::Device) -> Tensor<B, 1> {
        self.apply(losses.clone())
            .into_values()
            .fold(Tensor::zeros([1], device), |total, loss| total + loss)
    }
}
