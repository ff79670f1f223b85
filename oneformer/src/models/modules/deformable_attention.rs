//! # Multi-Scale Deformable Attention
//!
//! Each query attends to a handful of locations per head and feature level instead of
//! to every position. The locations are offsets from the query's reference point,
//! predicted from the query itself, and the samples are mixed with softmax weights
//! that are predicted the same way.
//!
//! Reference points come in two forms:
//! - `[.., 2]`: a point per level. Offsets are measured in pixels of that level.
//! - `[.., 4]`: a box per level, as centre and size. Offsets are measured in
//!   half box extents divided by the number of points.

use burn::{
    module::Ignored,
    nn::Linear,
    prelude::*,
    tensor::{activation::softmax, Bool},
};
use tracing::warn;

use super::{init::ComponentTag, LevelLayout};
use crate::{
    config::DeformableSampler,
    error::{OneFormerError, OneFormerResult},
};

#[derive(Config, Debug)]
pub struct MultiScaleDeformableAttentionConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    #[config(default = 3)]
    pub num_levels: usize,
    /// Sampling points per head and level.
    #[config(default = 4)]
    pub num_points: usize,
    #[config(default = "DeformableSampler::Fused")]
    pub sampler: DeformableSampler,
}

impl MultiScaleDeformableAttentionConfig {
    /// Build the attention layer.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if `embed_dim` is not
    /// divisible by `num_heads` or a level or point count is zero.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> OneFormerResult<MultiScaleDeformableAttention<B>> {
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "embed_dim (d_model) must be divisible by num_heads, but got {} and {}",
                    self.embed_dim, self.num_heads
                ),
            });
        }
        if self.num_levels == 0 || self.num_points == 0 {
            return Err(OneFormerError::invalid_configuration(
                "num_levels and num_points must be positive",
            ));
        }

        let head_dim = self.embed_dim / self.num_heads;
        if !head_dim.is_power_of_two() {
            warn!(
                head_dim,
                "attention head dimension is not a power of 2; sampling is less efficient"
            );
        }

        let level_points = self.num_levels * self.num_points;
        let offsets_tag = ComponentTag::SamplingOffsets {
            num_heads: self.num_heads,
            num_levels: self.num_levels,
            num_points: self.num_points,
        };

        Ok(MultiScaleDeformableAttention {
            sampling_offsets: offsets_tag.init_linear(
                self.embed_dim,
                self.num_heads * level_points * 2,
                device,
            ),
            attention_weights: ComponentTag::AttentionWeights.init_linear(
                self.embed_dim,
                self.num_heads * level_points,
                device,
            ),
            value_proj: ComponentTag::Projection.init_linear(self.embed_dim, self.embed_dim, device),
            output_proj: ComponentTag::Projection.init_linear(self.embed_dim, self.embed_dim, device),
            embed_dim: self.embed_dim,
            num_heads: self.num_heads,
            num_levels: self.num_levels,
            num_points: self.num_points,
            sampler: Ignored(self.sampler.clone()),
        })
    }
}

/// Inputs of one deformable attention call.
#[derive(Debug, Clone)]
pub struct DeformableAttentionInput<B: Backend> {
    /// Queries, `[batch, queries, embed_dim]`.
    pub hidden_states: Tensor<B, 3>,
    /// Added to the queries before offsets and weights are predicted.
    pub position_embeddings: Option<Tensor<B, 3>>,
    /// Flattened multi-level values, `[batch, sequence, embed_dim]`.
    pub encoder_hidden_states: Tensor<B, 3>,
    /// `[batch, sequence]`, `true` on padded positions, which contribute zero.
    pub padding_mask: Option<Tensor<B, 2, Bool>>,
    /// `[batch, queries, levels, 2]` points or `[batch, queries, levels, 4]` boxes,
    /// normalized to `[0, 1]`.
    pub reference_points: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct MultiScaleDeformableAttention<B: Backend> {
    sampling_offsets: Linear<B>,
    attention_weights: Linear<B>,
    value_proj: Linear<B>,
    output_proj: Linear<B>,
    embed_dim: usize,
    num_heads: usize,
    num_levels: usize,
    num_points: usize,
    sampler: Ignored<DeformableSampler>,
}

impl<B: Backend> MultiScaleDeformableAttention<B> {
    /// Switch the sampling path without touching the learned parameters.
    pub fn with_sampler(mut self, sampler: DeformableSampler) -> Self {
        self.sampler = Ignored(sampler);
        self
    }

    pub fn sampler(&self) -> &DeformableSampler {
        &self.sampler
    }

    /// Attend from every query to its sampled locations.
    ///
    /// Returns the attended features, `[batch, queries, embed_dim]`, and the
    /// softmax-normalized attention weights, `[batch, queries, heads, levels, points]`.
    ///
    /// # Errors
    ///
    /// - `Err(OneFormerError::ShapeMismatch)` if `layout` does not cover exactly the
    ///   encoder sequence, has a different number of levels than the layer, or the
    ///   reference points do not match the queries.
    /// - `Err(OneFormerError::InvalidReferencePoints)` if the reference points are
    ///   neither points nor boxes.
    pub fn forward(
        &self,
        input: DeformableAttentionInput<B>,
        layout: &LevelLayout,
    ) -> OneFormerResult<(Tensor<B, 3>, Tensor<B, 5>)> {
        let DeformableAttentionInput {
            hidden_states,
            position_embeddings,
            encoder_hidden_states,
            padding_mask,
            reference_points,
        } = input;

        let hidden_states = match position_embeddings {
            Some(position_embeddings) => hidden_states + position_embeddings,
            None => hidden_states,
        };

        let [batch, queries, _] = hidden_states.dims();
        let [_, sequence, _] = encoder_hidden_states.dims();
        if layout.sequence_length() != sequence {
            return Err(OneFormerError::shape_mismatch(
                format!("spatial shapes covering {sequence} positions"),
                format!("{} positions", layout.sequence_length()),
            ));
        }
        if layout.num_levels() != self.num_levels {
            return Err(OneFormerError::shape_mismatch(
                format!("{} feature levels", self.num_levels),
                format!("{} feature levels", layout.num_levels()),
            ));
        }

        let [ref_batch, ref_queries, ref_levels, coords] = reference_points.dims();
        if coords != 2 && coords != 4 {
            return Err(OneFormerError::InvalidReferencePoints { last_dim: coords });
        }
        if [ref_batch, ref_queries, ref_levels] != [batch, queries, self.num_levels] {
            return Err(OneFormerError::shape_mismatch(
                format!("reference points [{batch}, {queries}, {}, {coords}]", self.num_levels),
                format!("[{ref_batch}, {ref_queries}, {ref_levels}, {coords}]"),
            ));
        }

        let heads = self.num_heads;
        let head_dim = self.embed_dim / heads;
        let level_points = self.num_levels * self.num_points;

        let mut value = self.value_proj.forward(encoder_hidden_states);
        if let Some(padding_mask) = padding_mask {
            let mask = padding_mask
                .unsqueeze_dim::<3>(2)
                .expand([batch, sequence, self.embed_dim]);
            value = value.mask_fill(mask, 0.0);
        }
        let value = value.reshape([batch, sequence, heads, head_dim]);

        let offsets = self
            .sampling_offsets
            .forward(hidden_states.clone())
            .reshape([batch, queries, heads, level_points, 2]);

        let attention_weights = self
            .attention_weights
            .forward(hidden_states)
            .reshape([batch, queries, heads, level_points]);
        let attention_weights = softmax(attention_weights, 3);

        let locations = self.sampling_locations(reference_points, offsets, layout)?;

        let output = self.sampler.sample(
            value,
            layout,
            locations,
            attention_weights.clone(),
        )?;
        let output = self.output_proj.forward(output);

        Ok((
            output,
            attention_weights.reshape([batch, queries, heads, self.num_levels, self.num_points]),
        ))
    }

    /// Absolute sampling locations, `[batch, queries, heads, levels * points, 2]`.
    fn sampling_locations(
        &self,
        reference_points: Tensor<B, 4>,
        offsets: Tensor<B, 5>,
        layout: &LevelLayout,
    ) -> OneFormerResult<Tensor<B, 5>> {
        let [batch, queries, levels, coords] = reference_points.dims();
        let level_points = levels * self.num_points;
        let device = reference_points.device();

        // [batch, queries, levels, 2] -> [batch, queries, 1, levels * points, 2]
        let per_point = |tensor: Tensor<B, 4>| {
            tensor
                .unsqueeze_dim::<5>(3)
                .expand([batch, queries, levels, self.num_points, 2])
                .reshape([batch, queries, 1, level_points, 2])
        };

        match coords {
            2 => {
                let mut normalizer = Vec::with_capacity(level_points * 2);
                for &[height, width] in layout.shapes() {
                    for _ in 0..self.num_points {
                        normalizer.push(1.0 / width as f32);
                        normalizer.push(1.0 / height as f32);
                    }
                }
                let normalizer = Tensor::<B, 5>::from_data(
                    TensorData::new(normalizer, [1, 1, 1, level_points, 2]),
                    &device,
                );

                Ok(per_point(reference_points) + offsets * normalizer)
            }
            4 => {
                let centres = reference_points
                    .clone()
                    .slice([0..batch, 0..queries, 0..levels, 0..2]);
                let extents = reference_points.slice([0..batch, 0..queries, 0..levels, 2..4]);
                let scale = 0.5 / self.num_points as f64;

                Ok(per_point(centres) + offsets * per_point(extents) * scale)
            }
            last_dim => Err(OneFormerError::InvalidReferencePoints { last_dim }),
        }
    }
}
