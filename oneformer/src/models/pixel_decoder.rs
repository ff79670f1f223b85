//! # Pixel Decoder
//!
//! Turns backbone features into per-pixel mask features and a multi-scale feature
//! list for the transformer decoder.
//!
//! ## Architecture
//! ```text
//! coarsest levels ──1x1 conv + GN──┐
//!                  sine pos + level embed ─► deformable encoder ─► per-level maps
//!                                                                      │
//! finer levels ──lateral 1x1 conv + GN──► + bilinear upsample ◄────────┘
//!                                          └─► 3x3 conv + GN + ReLU ─► ... ─► 1x1 mask projection
//! ```
//!
//! Backbone features are expected finest first, in the order of `strides`.

use burn::{
    module::{Ignored, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        GroupNorm, GroupNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::Bool,
};
use burn_extra_ops::TensorExtraOps;
use tracing::debug;

use super::{
    encoder::{DeformableEncoder, DeformableEncoderConfig, EncoderContext, EncoderLayerConfig},
    modules::{ComponentTag, LevelLayout, SinePositionEmbedding, SinePositionEmbeddingConfig},
};
use crate::{
    config::DeformableSampler,
    error::{OneFormerError, OneFormerResult},
    mode::ExecutionMode,
};

/// GroupNorm groups used after every projection in the pixel decoder.
pub(crate) const NORM_GROUPS: usize = 32;

/// Convolution followed by group normalization and an optional ReLU.
#[derive(Config, Debug)]
pub struct ConvNormConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = "1")]
    kernel_size: usize,
    #[config(default = "true")]
    bias: bool,
    #[config(default = "false")]
    relu: bool,
}

impl ConvNormConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvNorm<B> {
        let padding = self.kernel_size / 2;
        let conv = ComponentTag::Projection.init_conv2d(
            Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(self.bias),
            device,
        );

        ConvNorm {
            conv,
            norm: GroupNormConfig::new(NORM_GROUPS, self.out_channels).init(device),
            activation: self.relu.then(Relu::new),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
    activation: Option<Relu>,
}

impl<B: Backend> ConvNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.norm.forward(self.conv.forward(x));
        match &self.activation {
            Some(activation) => activation.forward(x),
            None => x,
        }
    }
}

/// Configuration of the [`PixelDecoder`].
#[derive(Config, Debug)]
pub struct PixelDecoderConfig {
    /// Channels of each backbone feature map, finest first.
    pub feature_channels: Vec<usize>,
    /// Stride of each backbone feature map, finest first.
    pub strides: Vec<usize>,
    #[config(default = 256)]
    pub conv_dim: usize,
    #[config(default = 256)]
    pub mask_dim: usize,
    #[config(default = 8)]
    pub num_heads: usize,
    #[config(default = 6)]
    pub encoder_layers: usize,
    #[config(default = 1024)]
    pub encoder_feedforward_dim: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 4)]
    pub common_stride: usize,
    #[config(default = 3)]
    pub num_feature_levels: usize,
    #[config(default = 4)]
    pub num_points: usize,
    #[config(default = "DeformableSampler::Fused")]
    pub sampler: DeformableSampler,
}

impl PixelDecoderConfig {
    /// Check that the layer settings are consistent with each other and with the
    /// backbone description.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> OneFormerResult<()> {
        if self.feature_channels.len() != self.strides.len() {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "feature_channels has {} entries but strides has {}",
                    self.feature_channels.len(),
                    self.strides.len()
                ),
            });
        }

        if self.num_feature_levels == 0 || self.num_feature_levels > self.strides.len() {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "num_feature_levels must be in [1, {}], got {}",
                    self.strides.len(),
                    self.num_feature_levels
                ),
            });
        }

        if self.num_heads == 0 || self.conv_dim % self.num_heads != 0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "conv_dim must be divisible by num_heads, but got {} and {}",
                    self.conv_dim, self.num_heads
                ),
            });
        }

        if self.conv_dim == 0 || self.conv_dim % NORM_GROUPS != 0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "conv_dim must be a positive multiple of {NORM_GROUPS} for group normalization, got {}",
                    self.conv_dim
                ),
            });
        }

        if self.num_points == 0 || self.mask_dim == 0 || self.encoder_feedforward_dim == 0 {
            return Err(OneFormerError::invalid_configuration(
                "num_points, mask_dim and encoder_feedforward_dim must be positive",
            ));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!("dropout must be in [0, 1), got {}", self.dropout),
            });
        }

        if !self.strides.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(OneFormerError::invalid_configuration(
                "strides must be strictly increasing (finest level first)",
            ));
        }

        let min_stride = self.strides[self.strides.len() - self.num_feature_levels];
        if !self.common_stride.is_power_of_two()
            || !min_stride.is_power_of_two()
            || self.common_stride > min_stride
        {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "common_stride ({}) and the finest encoder stride ({min_stride}) must be powers of two with common_stride <= {min_stride}",
                    self.common_stride
                ),
            });
        }

        let finer_levels = self.strides.len() - self.num_feature_levels;
        if self.fpn_levels() > finer_levels {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "{} feature pyramid levels requested but only {finer_levels} levels are finer than the encoder levels",
                    self.fpn_levels()
                ),
            });
        }

        Ok(())
    }

    /// Number of feature pyramid levels between the finest encoder level and `common_stride`.
    pub fn fpn_levels(&self) -> usize {
        let encoder_levels = self.num_feature_levels.min(self.strides.len());
        let min_stride = self.strides[self.strides.len() - encoder_levels..]
            .iter()
            .copied()
            .min()
            .unwrap_or(self.common_stride);
        let levels =
            i64::from(min_stride.max(1).ilog2()) - i64::from(self.common_stride.max(1).ilog2());
        levels.max(0) as usize
    }

    /// Build the pixel decoder.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if the configuration is invalid.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OneFormerResult<PixelDecoder<B>> {
        self.validate()?;

        let levels = self.num_feature_levels;
        let fpn_levels = self.fpn_levels();

        // Coarsest level first.
        let input_projections = self
            .feature_channels
            .iter()
            .rev()
            .take(levels)
            .map(|&channels| ConvNormConfig::new(channels, self.conv_dim).init(device))
            .collect();

        let layer = EncoderLayerConfig::new(self.conv_dim, self.num_heads)
            .with_num_levels(levels)
            .with_num_points(self.num_points)
            .with_feedforward_dim(self.encoder_feedforward_dim)
            .with_dropout(self.dropout)
            .with_sampler(self.sampler.clone());
        let encoder = DeformableEncoderConfig::new(layer)
            .with_num_layers(self.encoder_layers)
            .init(device)?;

        // Top-down order: the pyramid level right above the encoder levels first.
        let (lateral_convs, output_convs): (Vec<_>, Vec<_>) = self.feature_channels[..fpn_levels]
            .iter()
            .rev()
            .map(|&channels| {
                let lateral = ConvNormConfig::new(channels, self.conv_dim)
                    .with_bias(false)
                    .init(device);
                let output = ConvNormConfig::new(self.conv_dim, self.conv_dim)
                    .with_kernel_size(3)
                    .with_bias(false)
                    .with_relu(true)
                    .init(device);
                (lateral, output)
            })
            .unzip();

        let mask_projection = ComponentTag::Projection.init_conv2d(
            Conv2dConfig::new([self.conv_dim, self.mask_dim], [1, 1]),
            device,
        );

        let position_embedding = SinePositionEmbeddingConfig::new()
            .with_num_pos_feats(self.conv_dim / 2)
            .init()?;

        Ok(PixelDecoder {
            input_projections,
            level_embed: ComponentTag::LevelEmbedding.init_embedding([levels, self.conv_dim], device),
            encoder,
            lateral_convs,
            output_convs,
            mask_projection,
            position_embedding: Ignored(position_embedding),
            feature_channels: Ignored(self.feature_channels.clone()),
            num_feature_levels: levels,
            conv_dim: self.conv_dim,
        })
    }
}

/// Output of the [`PixelDecoder`].
#[derive(Debug, Clone)]
pub struct PixelDecoderOutput<B: Backend> {
    /// `[batch, mask_dim, height / common_stride, width / common_stride]`
    pub mask_features: Tensor<B, 4>,
    /// The encoder levels as `[batch, conv_dim, h, w]` maps, coarsest first.
    pub multi_scale_features: Vec<Tensor<B, 4>>,
    /// Attention weights of every encoder layer, `[batch, sequence, heads, levels, points]`.
    pub attentions: Vec<Tensor<B, 5>>,
}

#[derive(Module, Debug)]
pub struct PixelDecoder<B: Backend> {
    input_projections: Vec<ConvNorm<B>>,
    level_embed: Param<Tensor<B, 2>>,
    encoder: DeformableEncoder<B>,
    lateral_convs: Vec<ConvNorm<B>>,
    output_convs: Vec<ConvNorm<B>>,
    mask_projection: Conv2d<B>,
    position_embedding: Ignored<SinePositionEmbedding>,
    feature_channels: Ignored<Vec<usize>>,
    num_feature_levels: usize,
    conv_dim: usize,
}

impl<B: Backend> PixelDecoder<B> {
    /// Fuse the backbone features.
    ///
    /// `pixel_mask` is `[batch, height, width]` with `true` on real pixels; without it
    /// every pixel counts as real. It is resized to each level by nearest sampling.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if the features do not match the
    /// configured channels or disagree on the batch size, or if the pixel mask has
    /// a different batch size.
    pub fn forward(
        &self,
        features: &[Tensor<B, 4>],
        pixel_mask: Option<Tensor<B, 3, Bool>>,
        mode: ExecutionMode,
    ) -> OneFormerResult<PixelDecoderOutput<B>> {
        let batch = self.check_features(features)?;
        if let Some(mask) = &pixel_mask {
            let [mask_batch, _, _] = mask.dims();
            if mask_batch != batch {
                return Err(OneFormerError::shape_mismatch(
                    format!("pixel mask for {batch} images"),
                    format!("{mask_batch} images"),
                ));
            }
        }

        let conv_dim = self.conv_dim;
        let mut sources = Vec::with_capacity(self.num_feature_levels);
        let mut position_embeddings = Vec::with_capacity(self.num_feature_levels);
        let mut padding_masks = Vec::with_capacity(self.num_feature_levels);
        let mut valid_ratios = Vec::with_capacity(self.num_feature_levels);
        let mut shapes = Vec::with_capacity(self.num_feature_levels);

        let encoder_features = features.iter().rev().take(self.num_feature_levels);
        for (level, (feature, projection)) in encoder_features
            .zip(&self.input_projections)
            .enumerate()
        {
            let source = projection.forward(feature.clone());
            let [_, _, height, width] = source.dims();
            let device = source.device();

            let padding = level_padding(pixel_mask.as_ref(), batch, [height, width], &device);
            let level_embed = self
                .level_embed
                .val()
                .slice([level..level + 1, 0..conv_dim])
                .reshape([1, 1, conv_dim]);
            let position = flatten(self.position_embedding.forward(padding.clone())) + level_embed;

            sources.push(flatten(source));
            position_embeddings.push(position);
            valid_ratios.push(valid_ratio(padding.clone()));
            padding_masks.push(padding.reshape([batch, height * width]));
            shapes.push([height, width]);
        }

        let layout = LevelLayout::new(shapes);
        let valid_ratios = Tensor::cat(valid_ratios, 1);
        let context = EncoderContext {
            position_embeddings: Tensor::cat(position_embeddings, 1),
            padding_mask: Tensor::cat(padding_masks, 1),
            reference_points: DeformableEncoder::reference_points(&layout, valid_ratios),
            layout,
        };
        let encoded = self
            .encoder
            .forward(Tensor::cat(sources, 1), &context, mode)?;

        let hidden = encoded.last_hidden_state;
        let mut outputs: Vec<Tensor<B, 4>> = context
            .layout
            .shapes()
            .iter()
            .zip(context.layout.starts())
            .map(|(&[height, width], &start)| {
                hidden
                    .clone()
                    .slice([0..batch, start..start + height * width, 0..conv_dim])
                    .swap_dims(1, 2)
                    .reshape([batch, conv_dim, height, width])
            })
            .collect();

        let fpn_features = features[..self.lateral_convs.len()].iter().rev();
        for ((feature, lateral), output) in fpn_features
            .zip(&self.lateral_convs)
            .zip(&self.output_convs)
        {
            let coarser = outputs
                .last()
                .cloned()
                .ok_or_else(|| OneFormerError::invalid_configuration("pixel decoder has no encoder levels"))?;
            let current = lateral.forward(feature.clone());
            let [_, _, height, width] = current.dims();
            let fused = current + coarser.resize_bilinear([height, width]);
            outputs.push(output.forward(fused));
        }

        let finest = outputs
            .last()
            .cloned()
            .ok_or_else(|| OneFormerError::invalid_configuration("pixel decoder has no encoder levels"))?;
        let mask_features = self.mask_projection.forward(finest);

        debug!(
            levels = self.num_feature_levels,
            fpn_levels = self.lateral_convs.len(),
            sequence = context.layout.sequence_length(),
            mask_features = ?mask_features.dims(),
            "pixel decoder forward"
        );

        outputs.truncate(self.num_feature_levels);
        Ok(PixelDecoderOutput {
            mask_features,
            multi_scale_features: outputs,
            attentions: encoded.attentions,
        })
    }

    /// Checks the backbone features and returns the batch size.
    fn check_features(&self, features: &[Tensor<B, 4>]) -> OneFormerResult<usize> {
        let expected = &*self.feature_channels;
        if features.len() != expected.len() {
            return Err(OneFormerError::shape_mismatch(
                format!("{} backbone feature maps", expected.len()),
                format!("{} feature maps", features.len()),
            ));
        }

        let mut batch = None;
        for (index, (feature, &channels)) in features.iter().zip(expected).enumerate() {
            let [feature_batch, feature_channels, _, _] = feature.dims();
            if feature_channels != channels {
                return Err(OneFormerError::shape_mismatch(
                    format!("{channels} channels in feature map {index}"),
                    format!("{feature_channels} channels"),
                ));
            }
            match batch {
                Some(batch) if batch != feature_batch => {
                    return Err(OneFormerError::shape_mismatch(
                        format!("batch size {batch} in feature map {index}"),
                        format!("batch size {feature_batch}"),
                    ));
                }
                _ => batch = Some(feature_batch),
            }
        }

        batch.ok_or_else(|| OneFormerError::shape_mismatch("at least one feature map", "none"))
    }
}

/// `[batch, channels, height, width]` to `[batch, height * width, channels]`.
fn flatten<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    x.reshape([batch, channels, height * width]).swap_dims(1, 2)
}

/// Padding mask of one level, `true` on padded pixels.
///
/// The pixel mask (`true` on real pixels) is resized by nearest sampling, picking
/// source pixel `floor(i * in / out)` for output pixel `i`.
fn level_padding<B: Backend>(
    pixel_mask: Option<&Tensor<B, 3, Bool>>,
    batch: usize,
    [height, width]: [usize; 2],
    device: &B::Device,
) -> Tensor<B, 3, Bool> {
    let Some(mask) = pixel_mask else {
        return Tensor::from_data(
            TensorData::new(vec![false; batch * height * width], [batch, height, width]),
            device,
        );
    };

    let [_, in_height, in_width] = mask.dims();
    let nearest = |input: usize, output: usize| {
        let indices: Vec<i64> = (0..output)
            .map(|index| ((index * input) / output).min(input.saturating_sub(1)) as i64)
            .collect();
        Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [output]), device)
    };

    mask.clone()
        .float()
        .select(1, nearest(in_height, height))
        .select(2, nearest(in_width, width))
        .lower_elem(0.5)
}

/// `(width, height)` fraction of real pixels, measured along the first column and
/// row, as `[batch, 1, 2]`.
fn valid_ratio<B: Backend>(padding: Tensor<B, 3, Bool>) -> Tensor<B, 3> {
    let [batch, height, width] = padding.dims();
    let valid = padding.bool_not().float();

    let valid_height = valid
        .clone()
        .slice([0..batch, 0..height, 0..1])
        .sum_dim(1)
        .reshape([batch, 1, 1])
        / height as f64;
    let valid_width = valid
        .slice([0..batch, 0..1, 0..width])
        .sum_dim(2)
        .reshape([batch, 1, 1])
        / width as f64;

    Tensor::cat(vec![valid_width, valid_height], 2)
}
