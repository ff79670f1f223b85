//! Configuration module for OneFormer.
//!
//! This module provides configuration structures and enums for the criterion
//! and the pixel decoder. It is organized into two submodules:
//! - `core`: Contains the main configuration structures
//! - `enums`: Contains all enumeration types used in configurations

pub mod core;
pub mod enums;

pub use core::{DecoderConfig, GeneralConfig, ModelConfig};
pub use enums::DeformableSampler;
