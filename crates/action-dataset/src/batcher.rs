//! Batching of decoded clips into normalised tensors.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use tracing::warn;

use action_core::DataConfig;

use crate::dataset::{ClipMeta, VideoClip};

/// A batch of clips
#[derive(Clone, Debug)]
pub struct VideoBatch<B: Backend> {
    /// `[batch, channels, frames, height, width]`
    pub clips: Tensor<B, 5>,
    /// `[batch]`
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<usize>,
    /// Source video of every clip
    pub sample_indices: Vec<usize>,
    pub metas: Vec<ClipMeta>,
}

impl<B: Backend> VideoBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Stacks clips and applies per-channel `(x - mean) / std`.
///
/// Clips that failed to decode are left out, so a batch may be smaller than
/// the loader's batch size or empty.
#[derive(Clone, Debug)]
pub struct VideoBatcher {
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for VideoBatcher {
    fn default() -> Self {
        Self::new([0.45; 3], [0.225; 3])
    }
}

impl VideoBatcher {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { mean, std }
    }

    pub fn from_config(data: &DataConfig) -> Self {
        Self::new(data.mean, data.std)
    }
}

impl<B: Backend> Batcher<B, VideoClip, VideoBatch<B>> for VideoBatcher {
    fn batch(&self, items: Vec<VideoClip>, device: &B::Device) -> VideoBatch<B> {
        let requested = items.len();
        let items: Vec<VideoClip> = items.into_iter().filter(|item| item.decoded).collect();
        if items.len() < requested {
            warn!("Dropped {} undecodable clips from a batch of {requested}", requested - items.len());
        }

        let batch_size = items.len();
        let [channels, frames, height, width] = items.first().map(|item| item.shape).unwrap_or([3, 0, 0, 0]);

        let clips_data: Vec<f32> = items.iter().flat_map(|item| item.data.iter().copied()).collect();
        let clips = Tensor::<B, 5>::from_floats(
            TensorData::new(clips_data, [batch_size, channels, frames, height, width]),
            device,
        );

        let clips = if batch_size == 0 {
            clips
        } else {
            let mean = Tensor::<B, 5>::from_floats(TensorData::new(self.mean.to_vec(), [1, 3, 1, 1, 1]), device);
            let std = Tensor::<B, 5>::from_floats(TensorData::new(self.std.to_vec(), [1, 3, 1, 1, 1]), device);
            (clips - mean) / std
        };

        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        let targets_data: Vec<i64> = labels.iter().map(|&label| label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        VideoBatch {
            clips,
            targets,
            labels,
            sample_indices: items.iter().map(|item| item.sample_index).collect(),
            metas: items.into_iter().map(|item| item.meta).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn clip(value: f32, label: usize, sample_index: usize) -> VideoClip {
        VideoClip {
            data: vec![value; 3 * 2 * 4 * 4],
            shape: [3, 2, 4, 4],
            label,
            sample_index,
            meta: ClipMeta {
                video_path: format!("v{sample_index}"),
                temporal_index: 0,
                spatial_index: 1,
            },
            decoded: true,
        }
    }

    #[test]
    fn test_batch_shape_and_normalisation() {
        let device = Default::default();
        let batcher = VideoBatcher::new([0.5; 3], [0.25; 3]);
        let batch: VideoBatch<TestBackend> = batcher.batch(vec![clip(1.0, 3, 0), clip(0.5, 1, 4)], &device);

        assert_eq!(batch.clips.dims(), [2, 3, 2, 4, 4]);
        assert_eq!(batch.labels, vec![3, 1]);
        assert_eq!(batch.sample_indices, vec![0, 4]);

        let values = batch.clips.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 2.0).abs() < 1e-6);
        assert!(values[values.len() - 1].abs() < 1e-6);

        let targets = batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![3, 1]);
    }

    #[test]
    fn test_undecoded_clips_are_dropped() {
        let device = Default::default();
        let batcher = VideoBatcher::default();
        let broken = VideoClip::undecoded(2, 1, ClipMeta::default());
        let batch: VideoBatch<TestBackend> =
            batcher.batch(vec![broken.clone(), clip(0.5, 1, 4), broken.clone()], &device);

        assert_eq!(batch.clips.dims(), [1, 3, 2, 4, 4]);
        assert_eq!(batch.labels, vec![1]);
        assert_eq!(batch.sample_indices, vec![4]);
        assert_eq!(batch.metas.len(), 1);

        let empty: VideoBatch<TestBackend> = batcher.batch(vec![broken], &device);
        assert!(empty.is_empty());
        assert_eq!(empty.clips.dims()[0], 0);
    }
}
