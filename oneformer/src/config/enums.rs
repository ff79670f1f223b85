//! Enumeration types for OneFormer configuration.

use burn::prelude::*;

/// Selects how the deformable attention samples its value maps.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum DeformableSampler {
    /// One `grid_sample` call per feature level, summed afterwards.
    Reference,
    /// A single gather over the concatenated levels.
    Fused,
}
