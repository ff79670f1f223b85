//! Parameter initialisation of the pixel decoder's learnable layers.
//!
//! Each learnable layer belongs to one [`ComponentTag`], and the tag alone decides
//! how its weight and bias start out. Layers are built through the tag instead of
//! being patched after construction.

use std::f64::consts::PI;

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, Linear, LinearConfig,
    },
    prelude::*,
};

/// Kind of learnable component, keyed to its initialisation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentTag {
    /// Value, output, feed-forward and convolution projections: Xavier-uniform
    /// weight and zero bias.
    Projection,
    /// Attention-weight head of deformable attention. Weight and bias are zero, so
    /// every sampling point starts with the same share.
    AttentionWeights,
    /// Sampling-offset head of deformable attention. The weight is zero and the bias
    /// holds one unit direction per head, scaled by point rank.
    SamplingOffsets {
        num_heads: usize,
        num_levels: usize,
        num_points: usize,
    },
    /// Learned per-level embedding added to the positional encoding: zero.
    LevelEmbedding,
}

impl ComponentTag {
    /// Build a linear layer initialised for this component.
    ///
    /// For [`ComponentTag::SamplingOffsets`], `d_output` must equal
    /// `num_heads * num_levels * num_points * 2`.
    pub fn init_linear<B: Backend>(
        self,
        d_input: usize,
        d_output: usize,
        device: &B::Device,
    ) -> Linear<B> {
        let mut linear = LinearConfig::new(d_input, d_output)
            .with_initializer(self.weight_initializer())
            .init(device);
        linear.bias = linear
            .bias
            .map(|_| Param::from_tensor(self.bias(d_output, device)));
        linear
    }

    /// Build a convolution initialised for this component.
    pub fn init_conv2d<B: Backend>(self, config: Conv2dConfig, device: &B::Device) -> Conv2d<B> {
        let out_channels = config.channels[1];
        let mut conv = config
            .with_initializer(self.weight_initializer())
            .init(device);
        conv.bias = conv
            .bias
            .map(|_| Param::from_tensor(self.bias(out_channels, device)));
        conv
    }

    /// Build a free-standing `[rows, cols]` parameter initialised for this component.
    pub fn init_embedding<B: Backend>(
        self,
        shape: [usize; 2],
        device: &B::Device,
    ) -> Param<Tensor<B, 2>> {
        self.weight_initializer()
            .init_with(shape, Some(shape[0]), Some(shape[1]), device)
    }

    fn weight_initializer(self) -> Initializer {
        match self {
            Self::Projection => Initializer::XavierUniform { gain: 1.0 },
            Self::AttentionWeights | Self::SamplingOffsets { .. } | Self::LevelEmbedding => {
                Initializer::Zeros
            }
        }
    }

    fn bias<B: Backend>(self, len: usize, device: &B::Device) -> Tensor<B, 1> {
        match self {
            Self::SamplingOffsets {
                num_heads,
                num_levels,
                num_points,
            } => {
                let grid = direction_grid(num_heads, num_levels, num_points);
                debug_assert_eq!(grid.len(), len, "sampling offset bias length");
                Tensor::from_data(TensorData::new(grid, [len]), device)
            }
            _ => Tensor::zeros([len], device),
        }
    }
}

/// Initial sampling offsets laid out as `[heads, levels, points, (x, y)]`.
///
/// Head `h` looks along angle `2 * pi * h / heads`, with the direction rescaled so
/// its larger component is 1. Point `p` sits `p + 1` steps along that direction on
/// every level.
fn direction_grid(num_heads: usize, num_levels: usize, num_points: usize) -> Vec<f32> {
    let mut grid = Vec::with_capacity(num_heads * num_levels * num_points * 2);
    for head in 0..num_heads {
        let theta = head as f64 * (2.0 * PI / num_heads as f64);
        let (sin, cos) = theta.sin_cos();
        let scale = cos.abs().max(sin.abs());
        let (dx, dy) = (cos / scale, sin / scale);

        for _ in 0..num_levels {
            for point in 0..num_points {
                let rank = (point + 1) as f64;
                grid.push((dx * rank) as f32);
                grid.push((dy * rank) as f32);
            }
        }
    }
    grid
}
