//! Video datasets for action-recognition fine-tuning.
//!
//! This crate provides:
//! - Split-file parsing and frame-directory decoding
//! - Temporal clip sampling and spatial crops
//! - burn `Dataset`/`Batcher` implementations for clips
//! - Rank-sharded sampling and the dataset/loader factory

pub mod batcher;
pub mod dataset;
pub mod factory;
pub mod frames;
pub mod sampler;
pub mod sampling;
pub mod split;

pub use batcher::{VideoBatch, VideoBatcher};
pub use dataset::{ClipMeta, ClipSampling, ClipSettings, VideoClip, VideoDataset};
pub use factory::{build_loader, DatasetBundle, DatasetFactory};
pub use sampler::{DistributedSampler, SampledDataset};
pub use split::VideoRecord;
