//! # Deformable Encoder
//!
//! A stack of post-norm transformer layers whose self-attention is multi-scale
//! deformable attention over the flattened feature levels. Every position of every
//! level is a query, anchored at its own pixel centre.

use burn::{
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, Relu},
    prelude::*,
    tensor::Bool,
};
use burn_extra_ops::clamp_non_finite;
use tracing::warn;

use super::modules::{
    ComponentTag, DeformableAttentionInput, LevelLayout, MultiScaleDeformableAttention,
    MultiScaleDeformableAttentionConfig,
};
use crate::{config::DeformableSampler, error::OneFormerResult, mode::ExecutionMode};

/// Smallest valid ratio a level is divided by; a fully padded level would be 0.
const MIN_VALID_RATIO: f64 = 1e-6;

/// Configuration of one [`EncoderLayer`].
#[derive(Config, Debug)]
pub struct EncoderLayerConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    #[config(default = 3)]
    pub num_levels: usize,
    #[config(default = 4)]
    pub num_points: usize,
    #[config(default = 1024)]
    pub feedforward_dim: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = "DeformableSampler::Fused")]
    pub sampler: DeformableSampler,
}

impl EncoderLayerConfig {
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if the attention settings are
    /// inconsistent.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OneFormerResult<EncoderLayer<B>> {
        let self_attn = MultiScaleDeformableAttentionConfig::new(self.embed_dim, self.num_heads)
            .with_num_levels(self.num_levels)
            .with_num_points(self.num_points)
            .with_sampler(self.sampler.clone())
            .init(device)?;

        Ok(EncoderLayer {
            self_attn,
            self_attn_layer_norm: LayerNormConfig::new(self.embed_dim).init(device),
            fc1: ComponentTag::Projection.init_linear(self.embed_dim, self.feedforward_dim, device),
            fc2: ComponentTag::Projection.init_linear(self.feedforward_dim, self.embed_dim, device),
            activation: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            final_layer_norm: LayerNormConfig::new(self.embed_dim).init(device),
        })
    }
}

/// Inputs shared by every encoder layer of one forward pass.
#[derive(Debug, Clone)]
pub struct EncoderContext<B: Backend> {
    /// Positional plus level embeddings, `[batch, sequence, embed_dim]`.
    pub position_embeddings: Tensor<B, 3>,
    /// `[batch, sequence]`, `true` on padded positions.
    pub padding_mask: Tensor<B, 2, Bool>,
    /// `[batch, sequence, levels, 2]`, see [`DeformableEncoder::reference_points`].
    pub reference_points: Tensor<B, 4>,
    pub layout: LevelLayout,
}

/// Post-norm encoder layer: deformable self-attention followed by a ReLU feed-forward block.
#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    self_attn: MultiScaleDeformableAttention<B>,
    self_attn_layer_norm: LayerNorm<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    final_layer_norm: LayerNorm<B>,
}

impl<B: Backend> EncoderLayer<B> {
    /// Returns the updated sequence and the layer's attention weights.
    ///
    /// # Errors
    ///
    /// Propagates shape errors from the deformable attention.
    pub fn forward(
        &self,
        hidden_states: Tensor<B, 3>,
        context: &EncoderContext<B>,
        mode: ExecutionMode,
    ) -> OneFormerResult<(Tensor<B, 3>, Tensor<B, 5>)> {
        let residual = hidden_states.clone();
        let (attended, attention_weights) = self.self_attn.forward(
            DeformableAttentionInput {
                hidden_states: hidden_states.clone(),
                position_embeddings: Some(context.position_embeddings.clone()),
                encoder_hidden_states: hidden_states,
                padding_mask: Some(context.padding_mask.clone()),
                reference_points: context.reference_points.clone(),
            },
            &context.layout,
        )?;
        let hidden_states = self
            .self_attn_layer_norm
            .forward(residual + self.apply_dropout(attended, mode));

        let residual = hidden_states.clone();
        let x = self.activation.forward(self.fc1.forward(hidden_states));
        let x = self.fc2.forward(self.apply_dropout(x, mode));
        let hidden_states = self
            .final_layer_norm
            .forward(residual + self.apply_dropout(x, mode));

        if !mode.is_training() {
            return Ok((hidden_states, attention_weights));
        }

        let (hidden_states, clamped) = clamp_non_finite(hidden_states);
        if clamped {
            warn!("non-finite encoder activations clamped to the finite range");
        }
        Ok((hidden_states, attention_weights))
    }

    fn apply_dropout<const D: usize>(&self, x: Tensor<B, D>, mode: ExecutionMode) -> Tensor<B, D> {
        if mode.is_training() {
            self.dropout.forward(x)
        } else {
            x
        }
    }
}

/// Configuration of the [`DeformableEncoder`].
#[derive(Config, Debug)]
pub struct DeformableEncoderConfig {
    pub layer: EncoderLayerConfig,
    #[config(default = 6)]
    pub num_layers: usize,
}

impl DeformableEncoderConfig {
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if the layer settings are
    /// inconsistent.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OneFormerResult<DeformableEncoder<B>> {
        let layers = (0..self.num_layers)
            .map(|_| self.layer.init(device))
            .collect::<OneFormerResult<Vec<_>>>()?;

        Ok(DeformableEncoder { layers })
    }
}

/// Output of the [`DeformableEncoder`].
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// `[batch, sequence, embed_dim]`
    pub last_hidden_state: Tensor<B, 3>,
    /// Attention weights of every layer, `[batch, sequence, heads, levels, points]`.
    pub attentions: Vec<Tensor<B, 5>>,
}

#[derive(Module, Debug)]
pub struct DeformableEncoder<B: Backend> {
    layers: Vec<EncoderLayer<B>>,
}

impl<B: Backend> DeformableEncoder<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Runs `inputs_embeds`, `[batch, sequence, embed_dim]`, through every layer.
    ///
    /// # Errors
    ///
    /// Propagates shape errors from the deformable attention.
    pub fn forward(
        &self,
        inputs_embeds: Tensor<B, 3>,
        context: &EncoderContext<B>,
        mode: ExecutionMode,
    ) -> OneFormerResult<EncoderOutput<B>> {
        let mut hidden_states = inputs_embeds;
        let mut attentions = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let (next, attention_weights) = layer.forward(hidden_states, context, mode)?;
            hidden_states = next;
            attentions.push(attention_weights);
        }

        Ok(EncoderOutput {
            last_hidden_state: hidden_states,
            attentions,
        })
    }

    /// Reference point of every position for every level.
    ///
    /// A position's reference is its pixel centre, normalized by the valid extent of
    /// its own level and then rescaled to the valid extent of each level it samples.
    /// Ratios are floored at a small positive value, so fully padded levels give
    /// far-away but finite references.
    ///
    /// # Shapes
    /// - valid_ratios: `[batch, levels, 2]`, `(width, height)` fraction of real pixels
    /// - output: `[batch, sequence, levels, 2]`
    pub fn reference_points(layout: &LevelLayout, valid_ratios: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, levels, _] = valid_ratios.dims();
        let device = valid_ratios.device();

        let per_level = layout
            .shapes()
            .iter()
            .enumerate()
            .map(|(level, &[height, width])| {
                let mut centres = Vec::with_capacity(height * width * 2);
                for row in 0..height {
                    for col in 0..width {
                        centres.push((col as f32 + 0.5) / width as f32);
                        centres.push((row as f32 + 0.5) / height as f32);
                    }
                }
                let centres = Tensor::<B, 3>::from_data(
                    TensorData::new(centres, [1, height * width, 2]),
                    &device,
                )
                .expand([batch, height * width, 2]);
                let ratio = valid_ratios
                    .clone()
                    .slice([0..batch, level..level + 1, 0..2])
                    .clamp_min(MIN_VALID_RATIO)
                    .expand([batch, height * width, 2]);

                centres / ratio
            })
            .collect();

        let points = Tensor::cat(per_level, 1);
        let sequence = layout.sequence_length();
        points
            .unsqueeze_dim::<4>(2)
            .expand([batch, sequence, levels, 2])
            * valid_ratios
                .unsqueeze_dim::<4>(1)
                .expand([batch, sequence, levels, 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::Distribution,
    };

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn encoder(layers: usize) -> DeformableEncoder<TestBackend> {
        encoder_with_dropout(layers, 0.1)
    }

    fn encoder_with_dropout<B: Backend>(layers: usize, dropout: f64) -> DeformableEncoder<B> {
        let layer = EncoderLayerConfig::new(32, 4)
            .with_num_levels(2)
            .with_num_points(2)
            .with_feedforward_dim(64)
            .with_dropout(dropout);
        DeformableEncoderConfig::new(layer)
            .with_num_layers(layers)
            .init(&Default::default())
            .unwrap()
    }

    fn context<B: Backend>(layout: LevelLayout) -> EncoderContext<B> {
        let device = Default::default();
        let sequence = layout.sequence_length();
        let valid_ratios = Tensor::<B, 3>::ones([2, layout.num_levels(), 2], &device);

        EncoderContext {
            position_embeddings: Tensor::random([2, sequence, 32], Distribution::Normal(0.0, 1.0), &device),
            padding_mask: Tensor::<B, 2>::zeros([2, sequence], &device).greater_elem(0.5),
            reference_points: DeformableEncoder::reference_points(&layout, valid_ratios),
            layout,
        }
    }

    fn max_difference<B: Backend>(a: Tensor<B, 3>, b: Tensor<B, 3>) -> f32 {
        (a - b).abs().max().into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_reference_points_at_pixel_centres() {
        let device = Default::default();
        let layout = LevelLayout::new(vec![[2, 2]]);
        let valid_ratios = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);

        let points = DeformableEncoder::reference_points(&layout, valid_ratios);
        assert_eq!(points.dims(), [1, 4, 1, 2]);

        let values = points.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.25, 0.25, 0.75, 0.25, 0.25, 0.75, 0.75, 0.75]);
    }

    #[test]
    fn test_reference_points_follow_valid_ratios() {
        let device = Default::default();
        // Level 0 has only its left half valid, level 1 is fully valid.
        let layout = LevelLayout::new(vec![[1, 2], [1, 1]]);
        let valid_ratios = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![0.5f32, 1.0, 1.0, 1.0], [1, 2, 2]),
            &device,
        );

        let values = DeformableEncoder::reference_points(&layout, valid_ratios)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        // First position of level 0: x = 0.25 / 0.5 = 0.5 on the valid extent,
        // which is 0.25 on level 0 and 0.5 on level 1.
        assert!((values[0] - 0.25).abs() < 1e-6);
        assert!((values[2] - 0.5).abs() < 1e-6);
        // The single position of level 1 sits at the centre, halved on level 0.
        let last = &values[values.len() - 4..];
        assert!((last[0] - 0.25).abs() < 1e-6);
        assert!((last[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_encoder_keeps_the_sequence_shape() {
        let device = Default::default();
        let encoder = encoder(2);
        let layout = LevelLayout::new(vec![[4, 4], [2, 2]]);
        let inputs = Tensor::<TestBackend, 3>::random([2, 20, 32], Distribution::Normal(0.0, 1.0), &device);

        let output = encoder
            .forward(inputs, &context(layout), ExecutionMode::Inference)
            .unwrap();

        assert_eq!(encoder.num_layers(), 2);
        assert_eq!(output.last_hidden_state.dims(), [2, 20, 32]);
        assert_eq!(output.attentions.len(), 2);
        assert_eq!(output.attentions[0].dims(), [2, 20, 4, 2, 2]);
    }

    #[test]
    fn test_training_without_autodiff_matches_inference() {
        let device = Default::default();
        let encoder = encoder(1);
        let context = context(LevelLayout::new(vec![[3, 3], [1, 2]]));
        let inputs = Tensor::<TestBackend, 3>::random([2, 11, 32], Distribution::Normal(0.0, 1.0), &device);

        let first = encoder
            .forward(inputs.clone(), &context, ExecutionMode::Inference)
            .unwrap();
        let second = encoder
            .forward(inputs, &context, ExecutionMode::Training)
            .unwrap();

        // Burn's dropout only acts on autodiff backends, and the finite guard does not fire.
        let diff = max_difference(first.last_hidden_state, second.last_hidden_state);
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_dropout_follows_the_execution_mode_under_autodiff() {
        let device = Default::default();
        let encoder = encoder_with_dropout::<TestAutodiffBackend>(1, 0.5);
        let context = context(LevelLayout::new(vec![[3, 3], [1, 2]]));
        let inputs =
            Tensor::<TestAutodiffBackend, 3>::random([2, 11, 32], Distribution::Normal(0.0, 1.0), &device);

        let run = |mode| {
            encoder
                .forward(inputs.clone(), &context, mode)
                .unwrap()
                .last_hidden_state
        };

        let inference = max_difference(run(ExecutionMode::Inference), run(ExecutionMode::Inference));
        assert!(inference < 1e-6, "inference changed between runs by {inference}");

        let training = max_difference(run(ExecutionMode::Training), run(ExecutionMode::Training));
        assert!(training > 1e-3, "dropout did not act in training mode");
    }

    #[test]
    fn test_fully_padded_level_keeps_references_finite() {
        let device = Default::default();
        let layout = LevelLayout::new(vec![[2, 2], [1, 1]]);
        // The second image has no valid pixel on level 0.
        let valid_ratios = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0], [2, 2, 2]),
            &device,
        );

        let values = DeformableEncoder::reference_points(&layout, valid_ratios)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(values.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn test_layout_must_match_the_sequence() {
        let device = Default::default();
        let encoder = encoder(1);
        let context = context(LevelLayout::new(vec![[4, 4], [2, 2]]));
        let inputs = Tensor::<TestBackend, 3>::zeros([2, 20, 32], &device);

        // Swapping in a layout for a shorter sequence is rejected by the attention.
        let mut broken = context.clone();
        broken.layout = LevelLayout::new(vec![[4, 4], [1, 1]]);
        assert!(encoder.forward(inputs.clone(), &broken, ExecutionMode::Inference).is_err());
        assert!(encoder.forward(inputs, &context, ExecutionMode::Inference).is_ok());
    }
}
