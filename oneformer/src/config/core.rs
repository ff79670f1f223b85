//! Core configuration structures for OneFormer.
//!
//! This module contains the configuration groups that drive the set criterion
//! (matching weights, point sampling, contrastive temperature) and the pixel
//! decoder (deformable encoder and feature pyramid).

use crate::{
    error::{OneFormerError, OneFormerResult},
    losses::{LossWeights, SetCriterion, SetCriterionConfig},
    models::{PixelDecoder, PixelDecoderConfig},
};
use burn::prelude::*;

use super::enums::*;

/// Main configuration for the OneFormer loss and pixel decoder.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Loss, matching and sampling configuration.
    pub general: GeneralConfig,
    /// Pixel decoder configuration.
    #[config(default = "DecoderConfig::new()")]
    pub decoder: DecoderConfig,
}

/// Loss, matching and point-sampling configuration.
#[derive(Config, Debug)]
pub struct GeneralConfig {
    /// Number of real classes, excluding the no-object class.
    pub num_classes: usize,
    /// Weight of the classification cost and loss.
    #[config(default = 2.0)]
    pub class_weight: f64,
    /// Weight of the point-sampled sigmoid cross-entropy cost and loss.
    #[config(default = 5.0)]
    pub mask_weight: f64,
    /// Weight of the point-sampled dice cost and loss.
    #[config(default = 5.0)]
    pub dice_weight: f64,
    /// Weight of the query-text contrastive loss.
    #[config(default = 0.5)]
    pub contrastive_weight: f64,
    /// Initial contrastive temperature. `None` disables the contrastive term.
    #[config(default = "Some(0.07)")]
    pub contrastive_temperature: Option<f64>,
    /// Classification weight of the no-object class.
    #[config(default = 0.1)]
    pub no_object_weight: f64,
    /// Number of points sampled per mask, both for matching and for the loss.
    #[config(default = 12544)]
    pub train_num_points: usize,
    /// Candidate points drawn per selected point by the uncertainty sampler.
    #[config(default = 3.0)]
    pub oversample_ratio: f64,
    /// Fraction of the point budget chosen by uncertainty.
    #[config(default = 0.75)]
    pub importance_sample_ratio: f64,
    /// Supervise every intermediate decoder layer as well as the last one.
    #[config(default = "true")]
    pub use_auxiliary_loss: bool,
}

/// Pixel decoder configuration.
///
/// `feature_channels` and `strides` describe the backbone features in the order the
/// backbone emits them, finest first.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Channel width of the encoder and the feature pyramid.
    #[config(default = 256)]
    pub conv_dim: usize,
    /// Channel width of the mask features.
    #[config(default = 256)]
    pub mask_dim: usize,
    /// Attention heads of each deformable attention layer.
    #[config(default = 8)]
    pub num_heads: usize,
    /// Number of deformable encoder layers.
    #[config(default = 6)]
    pub encoder_layers: usize,
    /// Hidden width of the encoder feed-forward block.
    #[config(default = 1024)]
    pub encoder_feedforward_dim: usize,
    /// Dropout probability inside the encoder.
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Output stride of the mask features.
    #[config(default = 4)]
    pub common_stride: usize,
    /// Number of coarsest backbone levels fed through the deformable encoder.
    #[config(default = 3)]
    pub num_feature_levels: usize,
    /// Sampling points per head and level.
    #[config(default = 4)]
    pub num_points: usize,
    /// Channels of each backbone feature map.
    #[config(default = "vec![96, 192, 384, 768]")]
    pub feature_channels: Vec<usize>,
    /// Stride of each backbone feature map.
    #[config(default = "vec![4, 8, 16, 32]")]
    pub strides: Vec<usize>,
    /// Sampling strategy of the deformable attention.
    #[config(default = "DeformableSampler::Fused")]
    pub sampler: DeformableSampler,
}

impl ModelConfig {
    /// Validate the configuration and return appropriate errors for invalid settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> OneFormerResult<()> {
        self.general.validate()?;
        self.decoder.validate()
    }

    /// Build the set criterion described by [`GeneralConfig`].
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if the configuration is invalid.
    pub fn init_criterion<B: Backend>(&self, device: &B::Device) -> OneFormerResult<SetCriterion<B>> {
        self.validate()?;
        self.general.criterion_config().init(device)
    }

    /// Build the pixel decoder described by [`DecoderConfig`].
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if the configuration is invalid.
    pub fn init_pixel_decoder<B: Backend>(
        &self,
        device: &B::Device,
    ) -> OneFormerResult<PixelDecoder<B>> {
        self.validate()?;
        self.decoder.pixel_decoder_config().init(device)
    }

    /// Per-term weights applied to the loss mapping.
    pub fn loss_weights(&self) -> LossWeights {
        LossWeights {
            class_weight: self.general.class_weight,
            mask_weight: self.general.mask_weight,
            dice_weight: self.general.dice_weight,
            contrastive_weight: self.general.contrastive_weight,
        }
    }
}

impl GeneralConfig {
    /// Check the loss, matching and sampling settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> OneFormerResult<()> {
        if self.num_classes == 0 {
            return Err(OneFormerError::invalid_configuration(
                "num_classes must be at least 1",
            ));
        }

        let weights = [
            ("class_weight", self.class_weight),
            ("mask_weight", self.mask_weight),
            ("dice_weight", self.dice_weight),
            ("contrastive_weight", self.contrastive_weight),
            ("no_object_weight", self.no_object_weight),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(OneFormerError::InvalidConfiguration {
                    reason: format!("{name} must be finite and non-negative, got {weight}"),
                });
            }
        }

        if self.class_weight == 0.0 && self.mask_weight == 0.0 && self.dice_weight == 0.0 {
            return Err(OneFormerError::invalid_configuration(
                "all matching costs can't be 0",
            ));
        }

        if let Some(temperature) = self.contrastive_temperature {
            if !temperature.is_finite() || temperature <= 0.0 {
                return Err(OneFormerError::InvalidConfiguration {
                    reason: format!("contrastive_temperature must be positive, got {temperature}"),
                });
            }
        }

        if self.train_num_points == 0 {
            return Err(OneFormerError::invalid_configuration(
                "train_num_points must be at least 1",
            ));
        }

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

        Ok(())
    }

    /// Criterion settings derived from this configuration.
    pub fn criterion_config(&self) -> SetCriterionConfig {
        SetCriterionConfig::new(self.num_classes)
            .with_class_weight(self.class_weight)
            .with_mask_weight(self.mask_weight)
            .with_dice_weight(self.dice_weight)
            .with_no_object_weight(self.no_object_weight)
            .with_contrastive_temperature(self.contrastive_temperature)
            .with_num_points(self.train_num_points)
            .with_oversample_ratio(self.oversample_ratio)
            .with_importance_sample_ratio(self.importance_sample_ratio)
            .with_use_auxiliary_loss(self.use_auxiliary_loss)
    }
}

impl DecoderConfig {
    /// Check the pixel decoder settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> OneFormerResult<()> {
        self.pixel_decoder_config().validate()
    }

    /// Number of feature pyramid levels between the finest encoder level and `common_stride`.
    pub fn fpn_levels(&self) -> usize {
        self.pixel_decoder_config().fpn_levels()
    }

    /// Pixel decoder settings derived from this configuration.
    pub fn pixel_decoder_config(&self) -> PixelDecoderConfig {
        PixelDecoderConfig::new(self.feature_channels.clone(), self.strides.clone())
            .with_conv_dim(self.conv_dim)
            .with_mask_dim(self.mask_dim)
            .with_num_heads(self.num_heads)
            .with_encoder_layers(self.encoder_layers)
            .with_encoder_feedforward_dim(self.encoder_feedforward_dim)
            .with_dropout(self.dropout)
            .with_common_stride(self.common_stride)
            .with_num_feature_levels(self.num_feature_levels)
            .with_num_points(self.num_points)
            .with_sampler(self.sampler.clone())
    }
}
