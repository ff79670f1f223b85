//! Query-text contrastive loss.
//!
//! Each image's task-conditioned queries, flattened to one vector, must be most
//! similar to the text queries of the same image. Similarities are cosine
//! similarities scaled by a learned inverse temperature.

use burn::{
    module::Param,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    prelude::*,
};

use crate::error::{OneFormerError, OneFormerResult};

/// Smallest norm used when normalizing embeddings.
const NORM_EPS: f64 = 1e-12;

/// Configuration for [`ContrastiveLoss`].
#[derive(Config, Debug)]
pub struct ContrastiveLossConfig {
    /// Initial temperature; the logit scale starts at `ln(1 / temperature)`.
    #[config(default = 0.07)]
    pub temperature: f64,
    /// Upper bound of the exponentiated logit scale.
    #[config(default = 100.0)]
    pub max_logit_scale: f64,
}

/// Symmetric cross-entropy between image-side and text-side query embeddings.
#[derive(Module, Debug)]
pub struct ContrastiveLoss<B: Backend> {
    /// Learned log inverse temperature.
    pub logit_scale: Param<Tensor<B, 1>>,
    pub max_logit_scale: f64,
    pub ce_loss: CrossEntropyLoss<B>,
}

impl ContrastiveLossConfig {
    /// Initialize the loss.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::InvalidConfiguration)` if the temperature or the
    /// scale bound is not positive.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OneFormerResult<ContrastiveLoss<B>> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!("temperature must be positive, got {}", self.temperature),
            });
        }
        if self.max_logit_scale.is_nan() || self.max_logit_scale <= 0.0 {
            return Err(OneFormerError::InvalidConfiguration {
                reason: format!("max_logit_scale must be positive, got {}", self.max_logit_scale),
            });
        }

        let initial = (1.0 / self.temperature).ln();
        Ok(ContrastiveLoss {
            logit_scale: Param::from_tensor(Tensor::from_floats([initial as f32], device)),
            max_logit_scale: self.max_logit_scale,
            ce_loss: CrossEntropyLossConfig::new().init(device),
        })
    }
}

impl<B: Backend> ContrastiveLoss<B> {
    /// Current `exp(logit_scale)`, clamped to `max_logit_scale`.
    pub fn scale(&self) -> Tensor<B, 1> {
        self.logit_scale.val().exp().clamp_max(self.max_logit_scale)
    }

    /// Calculate the contrastive loss.
    ///
    /// # Arguments
    /// * `image_queries` - Contrastive query embeddings, `[batch, queries, dim]`
    /// * `text_queries` - Text query embeddings of the same shape
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if the two sides disagree.
    pub fn forward(
        &self,
        image_queries: Tensor<B, 3>,
        text_queries: Tensor<B, 3>,
    ) -> OneFormerResult<Tensor<B, 1>> {
        if image_queries.dims() != text_queries.dims() {
            return Err(OneFormerError::shape_mismatch(
                format!("text queries of shape {:?}", image_queries.dims()),
                format!("{:?}", text_queries.dims()),
            ));
        }

        let [batch, queries, dim] = image_queries.dims();
        let device = image_queries.device();

        let image = l2_normalize(image_queries.reshape([batch, queries * dim]));
        let text = l2_normalize(text_queries.reshape([batch, queries * dim]));

        let logits_per_text = text.matmul(image.transpose()) * self.scale().unsqueeze::<2>();
        let logits_per_image = logits_per_text.clone().transpose();

        let targets = Tensor::<B, 1, Int>::arange(0..batch as i64, &device);
        let loss_image = self.ce_loss.forward(logits_per_image, targets.clone());
        let loss_text = self.ce_loss.forward(logits_per_text, targets);

        Ok(loss_image + loss_text)
    }
}

/// Scales every row to unit L2 norm.
fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powi_scalar(2).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_initial_scale_is_inverse_temperature() {
        let device = Default::default();
        let loss = ContrastiveLossConfig::new()
            .with_temperature(0.5)
            .init::<TestBackend>(&device)
            .unwrap();

        let scale: f32 = loss.scale().into_scalar();
        assert!((scale - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_scale_is_clamped() {
        let device = Default::default();
        let loss = ContrastiveLossConfig::new()
            .with_temperature(0.001)
            .init::<TestBackend>(&device)
            .unwrap();

        let scale: f32 = loss.scale().into_scalar();
        assert!((scale - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_aligned_pairs_have_lower_loss() {
        let device = Default::default();
        let loss = ContrastiveLossConfig::new().init::<TestBackend>(&device).unwrap();

        let image = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 0.0], [0.0, 0.0]], [[0.0, 1.0], [0.0, 0.0]]],
            &device,
        );
        let shuffled = Tensor::<TestBackend, 3>::from_floats(
            [[[0.0, 1.0], [0.0, 0.0]], [[1.0, 0.0], [0.0, 0.0]]],
            &device,
        );

        let aligned: f32 = loss.forward(image.clone(), image.clone()).unwrap().into_scalar();
        let swapped: f32 = loss.forward(image, shuffled).unwrap().into_scalar();

        assert!(aligned < 1e-3, "got {aligned}");
        assert!(swapped > aligned + 1.0);
    }

    #[test]
    fn test_logit_scale_receives_gradient() {
        let device = Default::default();
        let loss = ContrastiveLossConfig::new()
            .init::<Autodiff<TestBackend>>(&device)
            .unwrap();

        let image = Tensor::<Autodiff<TestBackend>, 3>::random(
            [3, 2, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let text = Tensor::<Autodiff<TestBackend>, 3>::random(
            [3, 2, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let grads = loss.forward(image, text).unwrap().backward();
        assert!(loss.logit_scale.grad(&grads).is_some());
    }

    #[test]
    fn test_invalid_temperature_is_rejected() {
        let device = Default::default();
        let result = ContrastiveLossConfig::new()
            .with_temperature(0.0)
            .init::<TestBackend>(&device);

        assert!(matches!(result, Err(OneFormerError::InvalidConfiguration { .. })));
    }
}
