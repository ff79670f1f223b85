//! Device-to-host transfers for the parts of the pipeline that run on the CPU.

use burn::prelude::*;

use crate::error::{OneFormerError, OneFormerResult};

/// Reads a float tensor back as `f32` values, whatever the backend's float type.
pub(crate) fn to_host_f32<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    operation: &str,
) -> OneFormerResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| OneFormerError::TensorOperationFailed {
            operation: format!("{operation}: {err:?}"),
        })
}

/// Draws `count` coordinates uniformly from `[0, 1)`.
pub(crate) fn uniform_coords<R: rand::Rng>(rng: &mut R, count: usize) -> Vec<f32> {
    (0..count).map(|_| rng.random::<f32>()).collect()
}
