//! Ground-truth objects of one image and their batched, padded form.

use burn::prelude::*;

use crate::error::{OneFormerError, OneFormerResult};

/// Ground-truth objects of one image.
///
/// Every object has a class label in `[0, num_classes)` and a binary mask. An image
/// may have no objects at all; it still carries its spatial size so it can take part
/// in batch padding.
#[derive(Debug, Clone)]
pub struct SegmentationTarget<B: Backend> {
    masks: Option<Tensor<B, 3>>,
    labels: Vec<usize>,
    size: [usize; 2],
}

impl<B: Backend> SegmentationTarget<B> {
    /// Creates a target from `[objects, height, width]` binary masks and one label per mask.
    ///
    /// # Errors
    ///
    /// Returns `Err(OneFormerError::ShapeMismatch)` if the number of masks and labels differ.
    pub fn new(masks: Tensor<B, 3>, labels: Vec<usize>) -> OneFormerResult<Self> {
        let [objects, height, width] = masks.dims();
        if objects != labels.len() {
            return Err(OneFormerError::shape_mismatch(
                format!("{objects} labels, one per mask"),
                format!("{} labels", labels.len()),
            ));
        }

        Ok(Self {
            masks: (objects > 0).then_some(masks),
            labels,
            size: [height, width],
        })
    }

    /// An image of the given size without any ground-truth object.
    pub const fn empty(height: usize, width: usize) -> Self {
        Self {
            masks: None,
            labels: Vec::new(),
            size: [height, width],
        }
    }

    /// Binary masks, `[objects, height, width]`, or `None` when the image has no object.
    pub fn masks(&self) -> Option<&Tensor<B, 3>> {
        self.masks.as_ref()
    }

    /// Class label of each object.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// `[height, width]` of the masks.
    pub const fn size(&self) -> [usize; 2] {
        self.size
    }

    /// Number of ground-truth objects.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// `true` if the image has no ground-truth object.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Target masks of a batch zero-padded to common dimensions.
#[derive(Debug, Clone)]
pub struct PaddedTargets<B: Backend> {
    /// `[batch, max_objects, max_height, max_width]`, zero where padded.
    pub masks: Tensor<B, 4>,
}

impl<B: Backend> PaddedTargets<B> {
    /// Pads the masks of every image to the largest object count, height and width
    /// in the batch.
    ///
    /// Returns `None` if no image in the batch has an object.
    pub fn from_targets(targets: &[SegmentationTarget<B>], device: &B::Device) -> Option<Self> {
        let max_objects = targets.iter().map(SegmentationTarget::len).max()?;
        if max_objects == 0 {
            return None;
        }
        let max_height = targets.iter().map(|t| t.size()[0]).max()?;
        let max_width = targets.iter().map(|t| t.size()[1]).max()?;
        let batch = targets.len();

        let mut masks = Tensor::zeros([batch, max_objects, max_height, max_width], device);

        for (index, target) in targets.iter().enumerate() {
            let [height, width] = target.size();
            if let Some(target_masks) = target.masks() {
                masks = masks.slice_assign(
                    [index..index + 1, 0..target.len(), 0..height, 0..width],
                    target_masks.clone().unsqueeze::<4>(),
                );
            }
        }

        Some(Self { masks })
    }

    /// Maximum number of objects per image.
    pub fn max_objects(&self) -> usize {
        self.masks.dims()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_label_count_must_match_masks() {
        let device = Default::default();
        let masks = Tensor::<TestBackend, 3>::ones([2, 4, 4], &device);

        let result = SegmentationTarget::new(masks, vec![1]);
        assert!(matches!(result, Err(OneFormerError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_padding_to_batch_maximum() {
        let device = Default::default();
        let first = SegmentationTarget::new(Tensor::<TestBackend, 3>::ones([1, 2, 3], &device), vec![0])
            .unwrap();
        let second =
            SegmentationTarget::new(Tensor::<TestBackend, 3>::ones([2, 4, 2], &device), vec![1, 2])
                .unwrap();
        let third = SegmentationTarget::<TestBackend>::empty(1, 1);

        let padded = PaddedTargets::from_targets(&[first, second, third], &device).unwrap();
        assert_eq!(padded.masks.dims(), [3, 2, 4, 3]);
        assert_eq!(padded.max_objects(), 2);

        // Only the real pixels of real objects are set.
        let total: f32 = padded.masks.clone().sum().into_scalar();
        assert_eq!(total, (2 * 3 + 2 * 4 * 2) as f32);

        // The first image's object stays in the top-left corner of its padded slot.
        let first_slot: f32 = padded
            .masks
            .clone()
            .slice([0..1, 0..1, 0..2, 0..3])
            .sum()
            .into_scalar();
        assert_eq!(first_slot, 6.0);
    }

    #[test]
    fn test_batch_without_objects_has_nothing_to_pad() {
        let device = Default::default();
        let targets = [
            SegmentationTarget::<TestBackend>::empty(4, 4),
            SegmentationTarget::<TestBackend>::empty(8, 8),
        ];

        assert!(PaddedTargets::from_targets(&targets, &device).is_none());
    }
}
