//! Dataset and loader construction.

use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use tracing::{info, warn};

use action_core::{DataSplit, DatasetName, Result, RunConfig};

use crate::batcher::{VideoBatch, VideoBatcher};
use crate::dataset::{ClipSampling, VideoClip, VideoDataset};

/// The three datasets a fine-tuning run needs
#[derive(Debug, Clone)]
pub struct DatasetBundle {
    pub name: DatasetName,
    pub train: Arc<VideoDataset>,
    /// Single clip, single crop per video
    pub val: Arc<VideoDataset>,
    /// Every temporal view and spatial crop of every validation video
    pub multi_view: Arc<VideoDataset>,
    /// Config the multi-view set was built with (spatial crops overridden)
    pub multi_view_config: RunConfig,
}

pub struct DatasetFactory;

impl DatasetFactory {
    /// Build train, single-view and multi-view datasets for `name`.
    ///
    /// `name` is parsed before any split file is touched, so an unknown
    /// dataset fails fast as a configuration error.
    pub fn build(name: &str, config: &RunConfig) -> Result<DatasetBundle> {
        let name: DatasetName = name.parse()?;
        config.validate()?;

        if config.model.num_classes != name.num_classes() {
            warn!(
                "MODEL.NUM_CLASSES={} differs from the {} label set ({} classes)",
                config.model.num_classes,
                name,
                name.num_classes()
            );
        }

        let train = VideoDataset::from_split(config, DataSplit::Train, ClipSampling::Train)?;

        let val_config = config.with_spatial_crops(1);
        let val = VideoDataset::from_split(&val_config, DataSplit::Val, ClipSampling::SingleView)?;

        let multi_view_config = config.with_spatial_crops(name.multi_view_spatial_crops());
        let multi_view = VideoDataset::from_split(
            &multi_view_config,
            DataSplit::Val,
            ClipSampling::MultiView {
                views: multi_view_config.test.num_ensemble_views,
                crops: multi_view_config.test.num_spatial_crops,
            },
        )?;

        info!(
            "{name}: {} train videos, {} val videos, {} multi-view clips ({} views x {} crops)",
            train.num_videos(),
            val.num_videos(),
            multi_view.len(),
            multi_view_config.test.num_ensemble_views,
            multi_view_config.test.num_spatial_crops
        );

        Ok(DatasetBundle {
            name,
            train: Arc::new(train),
            val: Arc::new(val),
            multi_view: Arc::new(multi_view),
            multi_view_config,
        })
    }
}

/// Loader over `dataset`, prefetching with `num_workers` threads.
///
/// Zero workers loads batches inline on the calling thread.
pub fn build_loader<B, D>(
    dataset: D,
    batcher: VideoBatcher,
    batch_size: usize,
    num_workers: usize,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, VideoBatch<B>>>
where
    B: Backend,
    D: Dataset<VideoClip> + 'static,
{
    let mut builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size.max(1))
        .set_device(device.clone());
    // burn splits the dataset into `num_workers` parts and cannot split into none
    if num_workers > 0 {
        builder = builder.num_workers(num_workers);
    }
    builder.build(dataset)
}
