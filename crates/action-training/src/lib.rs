//! Training infrastructure for video action recognition.
//!
//! This crate provides:
//! - Transformer backbones (ViT with divided space-time attention, 3D Swin)
//! - Named-weight import with non-strict loading of pretrained checkpoints
//! - SGD with a multi-step learning-rate schedule, checkpoint and resume
//! - Training loop, single-view validation and multi-view test aggregation
//! - The end-to-end fine-tuning pipeline

pub mod backend;
pub mod checkpoint;
pub mod evaluator;
pub mod lr_schedule;
pub mod model;
pub mod multiview;
pub mod optim;
pub mod pipeline;
pub mod run_log;
pub mod trainer;
pub mod weights;

pub use checkpoint::{CheckpointHeader, TrainingCheckpoint};
pub use evaluator::{validate, ValidationStats};
pub use lr_schedule::MultiStepLr;
pub use model::{BackboneConfig, ClipClassifier, VideoClassifier};
pub use multiview::{test_multi_view, MultiViewMeter, MultiViewStats};
pub use optim::{build_optimizer, scaled_learning_rate};
pub use pipeline::{run_finetune, FinetuneOptions, FinetuneSummary};
pub use trainer::{train_one_epoch, EpochStats};
pub use weights::{LoadReport, StateDict};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{CheckpointHeader, TrainingCheckpoint};
    pub use super::model::{BackboneConfig, ClipClassifier, VideoClassifier};
    pub use super::multiview::{MultiViewMeter, MultiViewStats};
    pub use super::pipeline::{run_finetune, FinetuneOptions, FinetuneSummary};
    pub use super::weights::{LoadReport, StateDict};
}
