//! Point sampling for mask losses.
//!
//! - `point`: bilinear sampling of feature or label maps at normalized `[0, 1]` coordinates.
//! - `uncertainty`: importance sampling of points near the decision boundary of mask logits.

pub mod point;
pub mod uncertainty;

pub use point::{point_sample, point_sample_grid};
pub use uncertainty::{UncertaintySampler, UncertaintySamplerConfig};
