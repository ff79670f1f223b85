use std::f64::consts::PI;

use burn::{prelude::*, tensor::Bool};

use crate::error::{OneFormerError, OneFormerResult};

/// Configuration of the [`SinePositionEmbedding`].
#[derive(Config, Debug)]
pub struct SinePositionEmbeddingConfig {
    /// Features per axis. The embedding has twice as many channels.
    #[config(default = 64)]
    pub num_pos_feats: usize,
    #[config(default = 10000.0)]
    pub temperature: f64,
    /// Rescale the running position of each axis to `[0, scale]`.
    #[config(default = true)]
    pub normalize: bool,
    /// Range of normalized positions, `2 * pi` when unset.
    #[config(default = "None")]
    pub scale: Option<f64>,
}

impl SinePositionEmbeddingConfig {
    /// Build the embedding.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if `num_pos_feats` is zero or
    /// odd, or if a scale is given without normalization.
    pub fn init(&self) -> OneFormerResult<SinePositionEmbedding> {
        if self.num_pos_feats == 0 || self.num_pos_feats % 2 != 0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!(
                    "num_pos_feats must be a positive even number, got {}",
                    self.num_pos_feats
                ),
            });
        }
        if self.scale.is_some() && !self.normalize {
            return Err(OneFormerError::invalid_configuration(
                "normalize should be true if scale is passed",
            ));
        }

        Ok(SinePositionEmbedding {
            num_pos_feats: self.num_pos_feats,
            temperature: self.temperature,
            normalize: self.normalize,
            scale: self.scale.unwrap_or(2.0 * PI),
        })
    }
}

/// Fixed sine/cosine encoding of 2D positions, counted over valid pixels only.
#[derive(Debug, Clone)]
pub struct SinePositionEmbedding {
    num_pos_feats: usize,
    temperature: f64,
    normalize: bool,
    scale: f64,
}

impl SinePositionEmbedding {
    const EPS: f64 = 1e-6;

    /// Channels of the produced embedding.
    pub const fn channels(&self) -> usize {
        2 * self.num_pos_feats
    }

    /// Encodes every position of a `[batch, height, width]` padding mask (`true` on
    /// padded pixels) into `[batch, 2 * num_pos_feats, height, width]`.
    ///
    /// The first half of the channels encodes the row, the second half the column.
    /// Within each half, even channels hold sines and odd channels cosines.
    pub fn forward<B: Backend>(&self, padding_mask: Tensor<B, 3, Bool>) -> Tensor<B, 4> {
        let [batch, height, width] = padding_mask.dims();
        let device = padding_mask.device();
        let not_mask = padding_mask.bool_not().float();

        // Running count of valid pixels down each column and along each row.
        let rows = inclusive_prefix::<B>(height, &device)
            .transpose()
            .unsqueeze::<3>()
            .expand([batch, height, height]);
        let cols = inclusive_prefix::<B>(width, &device)
            .unsqueeze::<3>()
            .expand([batch, width, width]);
        let mut y_embed = rows.matmul(not_mask.clone());
        let mut x_embed = not_mask.matmul(cols);

        if self.normalize {
            let y_last = y_embed
                .clone()
                .slice([0..batch, height - 1..height, 0..width]);
            let x_last = x_embed
                .clone()
                .slice([0..batch, 0..height, width - 1..width]);
            y_embed = y_embed / (y_last + Self::EPS) * self.scale;
            x_embed = x_embed / (x_last + Self::EPS) * self.scale;
        }

        let pos_y = self.encode_axis(y_embed);
        let pos_x = self.encode_axis(x_embed);

        Tensor::cat(vec![pos_y, pos_x], 3).permute([0, 3, 1, 2])
    }

    /// `[batch, height, width]` positions to `[batch, height, width, num_pos_feats]`.
    fn encode_axis<B: Backend>(&self, positions: Tensor<B, 3>) -> Tensor<B, 4> {
        let device = positions.device();
        let feats = self.num_pos_feats;

        let mut inv_freq = Vec::with_capacity(feats);
        let mut even = Vec::with_capacity(feats);
        for index in 0..feats {
            let exponent = (2 * (index / 2)) as f64 / feats as f64;
            inv_freq.push(self.temperature.powf(-exponent) as f32);
            even.push(if index % 2 == 0 { 1.0f32 } else { 0.0 });
        }
        let inv_freq = Tensor::<B, 4>::from_data(TensorData::new(inv_freq, [1, 1, 1, feats]), &device);
        let even = Tensor::<B, 4>::from_data(TensorData::new(even, [1, 1, 1, feats]), &device);

        let angles = positions.unsqueeze_dim::<4>(3) * inv_freq;
        angles.clone().sin() * even.clone() + angles.cos() * (even.neg() + 1.0)
    }
}

/// `[size, size]` matrix with ones where `row <= col`: right-multiplying sums prefixes.
fn inclusive_prefix<B: Backend>(size: usize, device: &B::Device) -> Tensor<B, 2> {
    let values = (0..size)
        .flat_map(|row| (0..size).map(move |col| if row <= col { 1.0f32 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(values, [size, size]), device)
}
