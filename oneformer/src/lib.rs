//! # OneFormer for Burn
//!
//! Training-side building blocks of OneFormer-style universal segmentation:
//!
//! - [`sampling`]: point sampling of mask logits, uniform and uncertainty-driven.
//! - [`matcher`]: pairwise matching costs and the Hungarian matcher.
//! - [`losses`]: the [`SetCriterion`] and the individual loss terms it combines.
//! - [`models`]: multi-scale deformable attention and the pixel decoder built on it.
//!
//! Everything is configured through [`ModelConfig`].

pub mod config;
pub mod error;
mod host;
pub mod losses;
pub mod matcher;
pub mod mode;
pub mod models;
pub mod sampling;
pub mod target;

pub use config::{DecoderConfig, DeformableSampler, GeneralConfig, ModelConfig};
pub use error::{OneFormerError, OneFormerResult};
pub use losses::{LossMap, LossWeights, SetCriterion, SetCriterionConfig};
pub use matcher::{HungarianMatcher, HungarianMatcherConfig, MatchIndices};
pub use mode::ExecutionMode;
pub use models::{
    MultiScaleDeformableAttention, MultiScaleDeformableAttentionConfig, PixelDecoder,
    PixelDecoderConfig, PixelDecoderOutput,
};
pub use sampling::{UncertaintySampler, UncertaintySamplerConfig};
pub use target::SegmentationTarget;
