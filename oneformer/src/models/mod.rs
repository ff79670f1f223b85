//! # Pixel Decoder Architecture
//!
//! - `modules`: multi-scale deformable attention with its two sampling paths, the
//!   sine position embedding and the component initialisation rules.
//! - `encoder`: the stack of deformable encoder layers.
//! - `pixel_decoder`: input projections, encoder and feature pyramid put together.

pub mod encoder;
pub mod modules;
pub mod pixel_decoder;

pub use encoder::*;
pub use modules::*;
pub use pixel_decoder::*;
