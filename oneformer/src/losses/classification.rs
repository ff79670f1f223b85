//! Query classification loss with a down-weighted no-object class.

use burn::{
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    prelude::*,
    tensor::{backend::Backend, Int, Tensor},
};

use crate::error::{OneFormerError, OneFormerResult};

/// Configuration for [`ClassificationLoss`].
#[derive(Config, Debug)]
pub struct ClassificationLossConfig {
    /// Number of real classes. The no-object class gets index `num_classes`.
    pub num_classes: usize,
    /// Weight of the no-object class; every real class weighs 1.
    #[config(default = 0.1)]
    pub no_object_weight: f64,
}

/// Weighted cross-entropy over `num_classes + 1` query classes.
///
/// The mean is taken with respect to the class weights of the targets, so a batch
/// made mostly of no-object queries does not dilute the real classes.
#[derive(Module, Debug)]
pub struct ClassificationLoss<B: Backend> {
    pub num_classes: usize,
    pub ce_loss: CrossEntropyLoss<B>,
}

impl ClassificationLossConfig {
    /// Initialize a new classification loss with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassificationLoss<B> {
        ClassificationLoss {
            num_classes: self.num_classes,
            ce_loss: CrossEntropyLossConfig::new()
                .with_weights(Some(self.class_weights()))
                .init(device),
        }
    }

    /// `[1, .., 1, no_object_weight]`, one entry per class including no-object.
    pub fn class_weights(&self) -> Vec<f32> {
        let mut weights = vec![1.0; self.num_classes + 1];
        weights[self.num_classes] = self.no_object_weight as f32;
        weights
    }
}

impl<B: Backend> ClassificationLoss<B> {
    /// Calculate the classification loss.
    ///
    /// # Arguments
    /// * `logits` - Class logits with shape `[batch, queries, num_classes + 1]`
    /// * `targets` - Target class per query with shape `[batch, queries]`
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if the shapes disagree.
    pub fn forward(
        &self,
        logits: Tensor<B, 3>,
        targets: Tensor<B, 2, Int>,
    ) -> OneFormerResult<Tensor<B, 1>> {
        let [batch, queries, classes] = logits.dims();

        if classes != self.num_classes + 1 {
            return Err(OneFormerError::shape_mismatch(
                format!("{} class logits", self.num_classes + 1),
                format!("{classes} class logits"),
            ));
        }
        if targets.dims() != [batch, queries] {
            return Err(OneFormerError::shape_mismatch(
                format!("target classes of shape {:?}", [batch, queries]),
                format!("{:?}", targets.dims()),
            ));
        }

        Ok(self.ce_loss.forward(
            logits.reshape([batch * queries, classes]),
            targets.reshape([batch * queries]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_class_weights() {
        let weights = ClassificationLossConfig::new(3).class_weights();
        assert_eq!(weights, vec![1.0, 1.0, 1.0, 0.1]);
    }

    #[test]
    fn test_weighted_mean_matches_manual_computation() {
        let device = Default::default();
        let loss = ClassificationLossConfig::new(2)
            .with_no_object_weight(0.5)
            .init::<TestBackend>(&device);

        let logits = Tensor::<TestBackend, 3>::from_floats(
            [[[2.0, 0.0, 0.0], [0.0, 0.0, 1.0]]],
            &device,
        );
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[0, 2]], &device);

        let value: f32 = loss.forward(logits, targets).unwrap().into_scalar();

        let nll = |row: [f32; 3], target: usize| {
            let log_sum = row.iter().map(|v| v.exp()).sum::<f32>().ln();
            log_sum - row[target]
        };
        let expected = (nll([2.0, 0.0, 0.0], 0) + 0.5 * nll([0.0, 0.0, 1.0], 2)) / 1.5;
        assert!((value - expected).abs() < 1e-5, "got {value}, expected {expected}");
    }

    #[test]
    fn test_wrong_class_count_is_rejected() {
        let device = Default::default();
        let loss = ClassificationLossConfig::new(4).init::<TestBackend>(&device);

        let logits = Tensor::<TestBackend, 3>::zeros([1, 2, 3], &device);
        let targets = Tensor::<TestBackend, 2, Int>::zeros([1, 2], &device);

        assert!(matches!(
            loss.forward(logits, targets),
            Err(OneFormerError::ShapeMismatch { .. })
        ));
    }
}
