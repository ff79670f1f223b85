//! Loss functions for OneFormer training.
//!
//! The [`SetCriterion`] matches predictions to ground truth and produces a mapping
//! of named terms; [`LossWeights`] turns that mapping into one objective.

pub mod classification;
pub mod contrastive;
pub mod criterion;
pub mod mask;
pub mod weights;

use std::collections::BTreeMap;

use burn::prelude::*;

pub use classification::{ClassificationLoss, ClassificationLossConfig};
pub use contrastive::{ContrastiveLoss, ContrastiveLossConfig};
pub use criterion::{ContrastiveInputs, LayerPredictions, SetCriterion, SetCriterionConfig};
pub use mask::{dice_loss, sigmoid_ce_loss};
pub use weights::LossWeights;

/// Named scalar losses, each of shape `[1]`.
pub type LossMap<B> = BTreeMap<String, Tensor<B, 1>>;

/// Weighted cross-entropy over query classes.
pub const LOSS_CROSS_ENTROPY: &str = "loss_cross_entropy";
/// Point-sampled sigmoid cross-entropy of matched masks.
pub const LOSS_MASK: &str = "loss_mask";
/// Point-sampled dice loss of matched masks.
pub const LOSS_DICE: &str = "loss_dice";
/// Query-text contrastive loss.
pub const LOSS_CONTRASTIVE: &str = "loss_contrastive";
