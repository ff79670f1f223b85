//! Multi-scale deformable sampling.
//!
//! Values of several feature levels are flattened onto one sequence axis. Each query
//! samples every level at a few fractional locations per head, and the samples are
//! mixed with the query's attention weights. Two interchangeable paths compute the
//! same result:
//!
//! - [`DeformableSampler::Reference`] splits the sequence back into per-level maps
//!   and runs one bilinear grid sample per level.
//! - [`DeformableSampler::Fused`] gathers all levels in a single pass over the
//!   flattened axis, each sampled point carrying the layout of the level it reads.
//!
//! Both go through the same differentiable bilinear gather, so their gradients
//! agree as well as their outputs.

use burn::prelude::*;
use burn_extra_ops::{bilinear_sample_flat, grid_sample_bilinear, FlatLayout};

use crate::{
    config::DeformableSampler,
    error::{OneFormerError, OneFormerResult},
};

/// Spatial layout of feature levels flattened onto one sequence axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelLayout {
    shapes: Vec<[usize; 2]>,
    starts: Vec<usize>,
}

impl LevelLayout {
    /// Layout of levels with the given `[height, width]`, concatenated in order.
    pub fn new(shapes: Vec<[usize; 2]>) -> Self {
        let starts = shapes
            .iter()
            .scan(0, |offset, [height, width]| {
                let start = *offset;
                *offset += height * width;
                Some(start)
            })
            .collect();

        Self { shapes, starts }
    }

    /// `[height, width]` of every level.
    pub fn shapes(&self) -> &[[usize; 2]] {
        &self.shapes
    }

    /// Offset of every level's first position on the sequence axis.
    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    pub fn num_levels(&self) -> usize {
        self.shapes.len()
    }

    /// Total number of positions over all levels.
    pub fn sequence_length(&self) -> usize {
        self.shapes.iter().map(|[height, width]| height * width).sum()
    }

    /// Per-point layout for `queries` queries that each sample `level_points`
    /// points, ordered level by level.
    fn point_layout<B: Backend>(
        &self,
        queries: usize,
        level_points: usize,
        device: &B::Device,
    ) -> FlatLayout<B> {
        let points = level_points / self.num_levels().max(1);
        let total = queries * level_points;

        let mut widths = Vec::with_capacity(total);
        let mut heights = Vec::with_capacity(total);
        let mut starts = Vec::with_capacity(total);
        for _ in 0..queries {
            for index in 0..level_points {
                let level = index / points;
                let [height, width] = self.shapes[level];
                widths.push(width as f32);
                heights.push(height as f32);
                starts.push(self.starts[level] as f32);
            }
        }

        let tensor = |values: Vec<f32>| Tensor::from_data(TensorData::new(values, [1, total]), device);
        FlatLayout {
            widths: tensor(widths),
            heights: tensor(heights),
            starts: tensor(starts),
        }
    }
}

impl DeformableSampler {
    /// Samples `value` at `locations` and mixes the samples with `weights`.
    ///
    /// Locations are normalized `(x, y)` pairs where `[0, 1]` spans a level's map;
    /// samples falling outside the map read zeros. Along the `levels * points` axis,
    /// the points of level 0 come first.
    ///
    /// # Shapes
    /// - value: `[batch, sequence, heads, head_dim]`
    /// - locations: `[batch, queries, heads, levels * points, 2]`
    /// - weights: `[batch, queries, heads, levels * points]`
    /// - output: `[batch, queries, heads * head_dim]`
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if `value` does not span the
    /// layout, the points do not split evenly over the levels, or `locations` and
    /// `weights` disagree with `value` or with each other.
    pub fn sample<B: Backend>(
        &self,
        value: Tensor<B, 4>,
        layout: &LevelLayout,
        locations: Tensor<B, 5>,
        weights: Tensor<B, 4>,
    ) -> OneFormerResult<Tensor<B, 3>> {
        let [batch, sequence, heads, head_dim] = value.dims();
        let [location_batch, queries, location_heads, level_points, pair] = locations.dims();
        let groups = batch * heads;

        if sequence != layout.sequence_length() {
            return Err(OneFormerError::shape_mismatch(
                format!("{} values spanning the level layout", layout.sequence_length()),
                format!("{sequence} values"),
            ));
        }
        let levels = layout.num_levels();
        if levels == 0 || level_points == 0 || level_points % levels != 0 {
            return Err(OneFormerError::shape_mismatch(
                format!("sampling points divisible over {levels} levels"),
                format!("{level_points} points"),
            ));
        }
        if [location_batch, location_heads, pair] != [batch, heads, 2] {
            return Err(OneFormerError::shape_mismatch(
                format!("locations of shape [{batch}, _, {heads}, _, 2]"),
                format!("{:?}", locations.dims()),
            ));
        }
        if weights.dims() != [batch, queries, heads, level_points] {
            return Err(OneFormerError::shape_mismatch(
                format!("weights of shape {:?}", [batch, queries, heads, level_points]),
                format!("{:?}", weights.dims()),
            ));
        }

        let samples = match self {
            Self::Reference => sample_per_level(value, layout, locations),
            Self::Fused => sample_flat(value, layout, locations),
        };

        let weights = weights
            .swap_dims(1, 2)
            .reshape([groups, 1, queries, level_points]);

        Ok((samples * weights)
            .sum_dim(3)
            .reshape([batch, heads * head_dim, queries])
            .swap_dims(1, 2))
    }
}

/// One grid sample per level. Output: `[batch * heads, head_dim, queries, levels * points]`.
fn sample_per_level<B: Backend>(
    value: Tensor<B, 4>,
    layout: &LevelLayout,
    locations: Tensor<B, 5>,
) -> Tensor<B, 4> {
    let [batch, _, heads, head_dim] = value.dims();
    let [_, queries, _, level_points, _] = locations.dims();
    let points = level_points / layout.num_levels().max(1);
    let groups = batch * heads;

    // grid_sample addresses the map with [-1, 1]
    let grids = locations
        .swap_dims(1, 2)
        .reshape([groups, queries, level_points, 2])
        * 2.0
        - 1.0;
    let value = value.permute([0, 2, 3, 1]);

    let samples = layout
        .shapes()
        .iter()
        .zip(layout.starts())
        .enumerate()
        .map(|(level, (&[height, width], &start))| {
            let level_value = value
                .clone()
                .slice([0..batch, 0..heads, 0..head_dim, start..start + height * width])
                .reshape([groups, head_dim, height, width]);
            let grid = grids.clone().slice([
                0..groups,
                0..queries,
                level * points..(level + 1) * points,
                0..2,
            ]);

            grid_sample_bilinear(level_value, grid)
        })
        .collect();

    Tensor::cat(samples, 3)
}

/// All levels in one gather. Output: `[batch * heads, head_dim, queries, levels * points]`.
fn sample_flat<B: Backend>(
    value: Tensor<B, 4>,
    layout: &LevelLayout,
    locations: Tensor<B, 5>,
) -> Tensor<B, 4> {
    let [batch, sequence, heads, head_dim] = value.dims();
    let [_, queries, _, level_points, _] = locations.dims();
    let groups = batch * heads;
    let total = queries * level_points;
    let device = value.device();

    let values = value
        .permute([0, 2, 3, 1])
        .reshape([groups, head_dim, sequence]);
    let locations = locations
        .swap_dims(1, 2)
        .reshape([groups, total, 2]);

    let point_layout = layout.point_layout::<B>(queries, level_points, &device);
    // Normalized to pixel coordinates with texel centres on integers.
    let x = locations
        .clone()
        .slice([0..groups, 0..total, 0..1])
        .reshape([groups, total])
        * point_layout.widths.clone()
        - 0.5;
    let y = locations
        .slice([0..groups, 0..total, 1..2])
        .reshape([groups, total])
        * point_layout.heights.clone()
        - 0.5;

    bilinear_sample_flat(values, x, y, &point_layout).reshape([
        groups,
        head_dim,
        queries,
        level_points,
    ])
}
