//! Bipartite matching between predicted queries and ground-truth objects.
//!
//! - `cost`: the pairwise classification, mask and dice costs of one image.
//! - `hungarian`: exact assignment on those costs for every image of a batch.

pub mod cost;
pub mod hungarian;

pub use cost::{pairwise_dice_loss, pairwise_sigmoid_ce_loss, CostMatrix, PairwiseCostEngine};
pub use hungarian::{
    linear_sum_assignment, HungarianMatcher, HungarianMatcherConfig, MatchIndices,
};
