//! # Bilinear Grid Sampling
//!
//! Differentiable bilinear sampling of feature maps at fractional pixel locations,
//! following the `align_corners = false` convention with zero padding: a sample
//! whose neighbouring texel lies outside the map receives no contribution from it.
//!
//! The building block is [`bilinear_sample_flat`], which samples maps that have
//! been flattened to `[batch, channels, positions]`. Every sampled point carries
//! its own map layout (width, height and start offset inside the flattened axis),
//! so points that belong to several differently sized maps concatenated along the
//! same axis can be gathered in a single pass.

use burn::prelude::*;

/// Location of one flattened `height x width` map inside a concatenated position axis,
/// given per sampled point.
///
/// Each tensor has shape `[1, points]` or `[batch, points]` and broadcasts against
/// the pixel coordinates passed to [`bilinear_sample_flat`].
#[derive(Debug, Clone)]
pub struct FlatLayout<B: Backend> {
    /// Width of the map each point samples from.
    pub widths: Tensor<B, 2>,
    /// Height of the map each point samples from.
    pub heights: Tensor<B, 2>,
    /// Offset of that map's first position on the flattened axis.
    pub starts: Tensor<B, 2>,
}

impl<B: Backend> FlatLayout<B> {
    /// Layout where all `points` sample from a single `height x width` map starting at 0.
    pub fn single(height: usize, width: usize, points: usize, device: &B::Device) -> Self {
        Self {
            widths: Tensor::full([1, points], width as f32, device),
            heights: Tensor::full([1, points], height as f32, device),
            starts: Tensor::zeros([1, points], device),
        }
    }
}

/// Bilinearly samples flattened maps at pixel coordinates.
///
/// Coordinates are expressed in pixel space where texel centres sit at integer
/// positions, i.e. the range `[-0.5, size - 0.5]` covers the map.
///
/// # Shapes
/// - values: `[batch, channels, positions]`
/// - x, y: `[batch, points]`
/// - output: `[batch, channels, points]`
pub fn bilinear_sample_flat<B: Backend>(
    values: Tensor<B, 3>,
    x: Tensor<B, 2>,
    y: Tensor<B, 2>,
    layout: &FlatLayout<B>,
) -> Tensor<B, 3> {
    let [batch, channels, _] = values.dims();
    let [_, points] = x.dims();

    // The integer corners carry no gradient; the fractional weights do.
    let x0 = x.clone().detach().floor();
    let y0 = y.clone().detach().floor();
    let x1 = x0.clone() + 1.0;
    let y1 = y0.clone() + 1.0;

    let wx0 = x1.clone() - x.clone();
    let wx1 = x - x0.clone();
    let wy0 = y1.clone() - y.clone();
    let wy1 = y - y0.clone();

    let sample_corner = |cx: Tensor<B, 2>, cy: Tensor<B, 2>, weight: Tensor<B, 2>| {
        let valid = in_bounds(cx.clone(), layout.widths.clone())
            * in_bounds(cy.clone(), layout.heights.clone());
        // Out-of-range corners are redirected to position 0 and masked out below.
        let index = (cy * layout.widths.clone() + cx + layout.starts.clone()) * valid.clone();
        let index = index
            .int()
            .reshape([batch, 1, points])
            .expand([batch, channels, points]);

        let gathered = values.clone().gather(2, index);
        gathered * (weight * valid).reshape([batch, 1, points])
    };

    sample_corner(x0.clone(), y0.clone(), wx0.clone() * wy0.clone())
        + sample_corner(x1.clone(), y0, wx1.clone() * wy0)
        + sample_corner(x0, y1.clone(), wx0 * wy1.clone())
        + sample_corner(x1, y1, wx1 * wy1)
}

/// `1.0` where `0 <= coord <= size - 1`, `0.0` elsewhere.
fn in_bounds<B: Backend>(coord: Tensor<B, 2>, size: Tensor<B, 2>) -> Tensor<B, 2> {
    let above_zero = coord.clone().greater_equal_elem(0.0).float();
    let below_size = (coord - (size - 1.0)).lower_equal_elem(0.0).float();
    above_zero * below_size
}

/// Samples `input` at the normalized locations in `grid`.
///
/// Matches `grid_sample(mode = "bilinear", padding_mode = "zeros", align_corners = false)`:
/// `-1` and `1` address the outer edges of the border texels.
///
/// # Shapes
/// - input: `[batch, channels, height, width]`
/// - grid: `[batch, out_h, out_w, 2]` holding `(x, y)` pairs
/// - output: `[batch, channels, out_h, out_w]`
pub fn grid_sample_bilinear<B: Backend>(input: Tensor<B, 4>, grid: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = input.dims();
    let [_, out_h, out_w, _] = grid.dims();
    let points = out_h * out_w;
    let device = input.device();

    let grid = grid.reshape([batch, points, 2]);
    let gx = grid
        .clone()
        .slice([0..batch, 0..points, 0..1])
        .reshape([batch, points]);
    let gy = grid
        .slice([0..batch, 0..points, 1..2])
        .reshape([batch, points]);

    let x = (gx + 1.0) * (width as f64 / 2.0) - 0.5;
    let y = (gy + 1.0) * (height as f64 / 2.0) - 0.5;

    let layout = FlatLayout::single(height, width, points, &device);
    let values = input.reshape([batch, channels, height * width]);

    bilinear_sample_flat(values, x, y, &layout).reshape([batch, channels, out_h, out_w])
}

/// Bilinear resize with `align_corners = false` semantics.
///
/// Burn's `interpolate` maps corners onto corners; feature pyramid upsampling
/// expects texel centres to line up instead. Source coordinates are clamped to the
/// border texels, so the edges replicate rather than fade to zero.
pub fn resize_bilinear<B: Backend>(input: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, height, width] = input.dims();
    let [out_h, out_w] = size;
    let points = out_h * out_w;
    let device = input.device();

    let source = |index: usize, input: usize, output: usize| {
        let coord = (index as f32 + 0.5) * input as f32 / output as f32 - 0.5;
        coord.clamp(0.0, input.saturating_sub(1) as f32)
    };

    let mut xs = Vec::with_capacity(points);
    let mut ys = Vec::with_capacity(points);
    for row in 0..out_h {
        let y = source(row, height, out_h);
        for col in 0..out_w {
            xs.push(source(col, width, out_w));
            ys.push(y);
        }
    }

    let coords = |values: Vec<f32>| {
        Tensor::<B, 2>::from_data(TensorData::new(values, [1, points]), &device)
            .expand([batch, points])
    };
    let layout = FlatLayout::single(height, width, points, &device);
    let values = input.reshape([batch, channels, height * width]);

    bilinear_sample_flat(values, coords(xs), coords(ys), &layout)
        .reshape([batch, channels, out_h, out_w])
}
