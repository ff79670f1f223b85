//! Bilinear point sampling at normalized coordinates.
//!
//! Coordinates address the full map: `(0, 0)` is the top-left corner of the
//! top-left texel and `(1, 1)` the bottom-right corner of the bottom-right texel.
//! They are remapped to the `[-1, 1]` convention of [`grid_sample_bilinear`], so
//! sampling stays differentiable with respect to both the map and the coordinates.

use burn::{prelude::*, tensor::ElementConversion};
use burn_extra_ops::grid_sample_bilinear;

use crate::error::{OneFormerError, OneFormerResult};

/// Samples `input` at `coords`.
///
/// # Shapes
/// - input: `[batch, channels, height, width]`
/// - coords: `[batch, points, 2]`, `(x, y)` pairs in `[0, 1]`
/// - output: `[batch, channels, points]`
///
/// # Errors
///
/// Returns `Err(OneFormerError::ShapeMismatch)` if the batch sizes differ or the
/// last axis of `coords` is not 2, and `Err(OneFormerError::CoordinatesOutOfRange)`
/// if a coordinate lies outside `[0, 1]`.
pub fn point_sample<B: Backend>(
    input: Tensor<B, 4>,
    coords: Tensor<B, 3>,
) -> OneFormerResult<Tensor<B, 3>> {
    let [batch, points, pair] = coords.dims();
    let [_, channels, _, _] = input.dims();

    if pair != 2 {
        return Err(OneFormerError::shape_mismatch(
            "point coordinates with a last dim of 2",
            format!("last dim {pair}"),
        ));
    }

    let sampled = point_sample_grid(input, coords.reshape([batch, 1, points, 2]))?;
    Ok(sampled.reshape([batch, channels, points]))
}

/// Samples `input` at a grid of coordinates.
///
/// # Shapes
/// - input: `[batch, channels, height, width]`
/// - coords: `[batch, grid_h, grid_w, 2]`, `(x, y)` pairs in `[0, 1]`
/// - output: `[batch, channels, grid_h, grid_w]`
///
/// # Errors
///
/// Returns `Err(OneFormerError::ShapeMismatch)` if the batch sizes differ or the
/// last axis of `coords` is not 2, and `Err(OneFormerError::CoordinatesOutOfRange)`
/// if a coordinate lies outside `[0, 1]`.
pub fn point_sample_grid<B: Backend>(
    input: Tensor<B, 4>,
    coords: Tensor<B, 4>,
) -> OneFormerResult<Tensor<B, 4>> {
    let [batch, _, _, _] = input.dims();
    let [coord_batch, _, _, pair] = coords.dims();

    if pair != 2 {
        return Err(OneFormerError::shape_mismatch(
            "point coordinates with a last dim of 2",
            format!("last dim {pair}"),
        ));
    }
    if coord_batch != batch {
        return Err(OneFormerError::shape_mismatch(
            format!("{batch} coordinate sets"),
            format!("{coord_batch} coordinate sets"),
        ));
    }

    check_range(coords.clone())?;

    Ok(grid_sample_bilinear(input, coords * 2.0 - 1.0))
}

fn check_range<B: Backend>(coords: Tensor<B, 4>) -> OneFormerResult<()> {
    if coords.shape().num_elements() == 0 {
        return Ok(());
    }

    let coords = coords.detach();
    let min = coords.clone().min().into_scalar().elem::<f64>();
    let max = coords.max().into_scalar().elem::<f64>();
    if min >= 0.0 && max <= 1.0 {
        Ok(())
    } else {
        Err(OneFormerError::CoordinatesOutOfRange { min, max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_constant_map_falls_off_only_near_the_border() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::full([2, 3, 5, 7], 0.75, &device);
        let coords = Tensor::<TestBackend, 3>::random(
            [2, 64, 2],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let out = point_sample(input, coords).unwrap();
        assert_eq!(out.dims(), [2, 3, 64]);

        // Coordinates within half a texel of the border pick up zero padding.
        let values = out.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v <= 0.75 + 1e-6 && *v >= 0.0));

        // The outer corner of a texel keeps a quarter of its value.
        let input = Tensor::<TestBackend, 4>::full([1, 1, 5, 7], 0.75, &device);
        let corner = Tensor::<TestBackend, 3>::from_floats([[[0.0, 0.0]]], &device);
        let value: f32 = point_sample(input, corner).unwrap().into_scalar();
        assert!((value - 0.1875).abs() < 1e-6, "got {value}");
    }

    #[test]
    fn test_interior_points_sample_constant_exactly() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::full([1, 2, 4, 4], -1.25, &device);
        // Every point lies between texel centres (0.125 .. 0.875).
        let coords = Tensor::<TestBackend, 3>::from_floats(
            [[[0.125, 0.125], [0.5, 0.3], [0.875, 0.875], [0.2, 0.61]]],
            &device,
        );

        let values = point_sample(input, coords)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for value in values {
            assert!((value + 1.25).abs() < 1e-5, "got {value}");
        }
    }

    #[test]
    fn test_texel_centre_returns_texel_value() {
        let device = Default::default();
        let input =
            Tensor::<TestBackend, 4>::from_floats([[[[1.0, 2.0], [3.0, 4.0]]]], &device);
        let coords = Tensor::<TestBackend, 3>::from_floats([[[0.75, 0.25], [0.25, 0.75]]], &device);

        let values = point_sample(input, coords)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((values[0] - 2.0).abs() < 1e-5);
        assert!((values[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_grid_coordinates_keep_their_layout() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::full([1, 4, 6, 6], 2.0, &device);
        let coords = Tensor::<TestBackend, 4>::full([1, 3, 5, 2], 0.5, &device);

        let out = point_sample_grid(input, coords).unwrap();
        assert_eq!(out.dims(), [1, 4, 3, 5]);
    }

    #[test]
    fn test_mismatched_batch_is_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);
        let coords = Tensor::<TestBackend, 3>::zeros([3, 8, 2], &device);

        match point_sample(input, coords) {
            Err(OneFormerError::ShapeMismatch { .. }) => {}
            other => panic!("Expected ShapeMismatch error, got {other:?}"),
        }
    }

    #[test]
    fn test_coordinates_without_pairs_are_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);
        let coords = Tensor::<TestBackend, 3>::zeros([1, 8, 3], &device);

        match point_sample(input, coords) {
            Err(OneFormerError::ShapeMismatch { actual, .. }) => {
                assert!(actual.contains("last dim 3"));
            }
            other => panic!("Expected ShapeMismatch error, got {other:?}"),
        }
    }

    #[test]
    fn test_coordinates_outside_the_map_are_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device);
        let coords = Tensor::<TestBackend, 3>::from_floats([[[5.0, -3.0]]], &device);

        match point_sample(input, coords) {
            Err(OneFormerError::CoordinatesOutOfRange { min, max }) => {
                assert_eq!(min, -3.0);
                assert_eq!(max, 5.0);
            }
            other => panic!("Expected CoordinatesOutOfRange error, got {other:?}"),
        }
    }

    #[test]
    fn test_gradient_reaches_the_sampled_map() {
        let device = Default::default();
        let input = Tensor::<Autodiff<TestBackend>, 4>::ones([1, 1, 3, 3], &device).require_grad();
        let coords = Tensor::<Autodiff<TestBackend>, 3>::from_floats([[[0.5, 0.5]]], &device);

        let grads = point_sample(input.clone(), coords).unwrap().sum().backward();
        let grad = input.grad(&grads).expect("input gradient");

        let centre: f32 = grad.slice([0..1, 0..1, 1..2, 1..2]).into_scalar();
        assert!((centre - 1.0).abs() < 1e-5);
    }
}
