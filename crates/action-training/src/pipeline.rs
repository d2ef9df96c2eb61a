//! End-to-end fine-tuning run.
//!
//! datasets -> model -> pretrained weights -> optimizer and scheduler ->
//! resume -> epochs (train, validate, log, checkpoint) -> multi-view test.

use std::path::PathBuf;

use burn::{data::dataset::Dataset, module::AutodiffModule, tensor::backend::AutodiffBackend};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use action_core::{Architecture, Collective, DistributedContext, Result, RunConfig};
use action_dataset::{build_loader, DatasetFactory, DistributedSampler, SampledDataset, VideoBatcher};

use crate::checkpoint::{CheckpointHeader, TrainingCheckpoint};
use crate::evaluator::{validate, ValidationStats};
use crate::lr_schedule::MultiStepLr;
use crate::model::{BackboneConfig, VideoClassifier};
use crate::multiview::{test_multi_view, MultiViewMeter, MultiViewStats};
use crate::optim::{build_optimizer, scaled_learning_rate};
use crate::run_log::{epoch_log_entry, RunLog};
use crate::trainer::train_one_epoch;

/// Run options taken from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneOptions {
    pub arch: Architecture,
    pub patch_size: usize,
    pub pretrained_weights: Option<PathBuf>,
    /// Entry of the pretraining checkpoint holding the backbone
    pub checkpoint_key: String,
    /// Recorded only; the classifier always reads the final class token
    pub n_last_blocks: usize,
    /// Recorded only
    pub avgpool_patchtokens: bool,
    pub epochs: usize,
    /// Base rate, scaled by the global batch size
    pub lr: f64,
    pub batch_size_per_gpu: usize,
    pub num_workers: usize,
    pub val_freq: usize,
    pub output_dir: PathBuf,
    pub dataset: String,
    pub seed: u64,
}

impl Default for FinetuneOptions {
    fn default() -> Self {
        Self {
            arch: Architecture::VitSmall,
            patch_size: 16,
            pretrained_weights: None,
            checkpoint_key: "teacher".into(),
            n_last_blocks: 4,
            avgpool_patchtokens: false,
            epochs: 100,
            lr: 0.001,
            batch_size_per_gpu: 128,
            num_workers: 10,
            val_freq: 1,
            output_dir: PathBuf::from("."),
            dataset: "ucf101".into(),
            seed: 0,
        }
    }
}

/// What a run ended with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneSummary {
    pub start_epoch: usize,
    pub epochs: usize,
    /// Best single-view top-1 accuracy (percent)
    pub best_acc: f64,
    pub last_validation: Option<ValidationStats>,
    pub multi_view: MultiViewStats,
}

/// Fine-tune and evaluate as configured.
///
/// `on_test_batch(done, total)` is called after every multi-view test batch.
pub fn run_finetune<B>(
    options: &FinetuneOptions,
    config: &RunConfig,
    collective: &dyn Collective,
    mut on_test_batch: impl FnMut(usize, usize),
) -> Result<FinetuneSummary>
where
    B: AutodiffBackend,
{
    let ctx = DistributedContext::new(collective.rank(), collective.world_size())?;
    let role = ctx.role();
    let device = B::Device::default();
    B::seed(options.seed + ctx.rank as u64);

    // ============ preparing data ... ============
    let bundle = DatasetFactory::build(&options.dataset, config)?;
    let batcher = VideoBatcher::from_config(&config.data);
    let batch_size = options.batch_size_per_gpu.max(1);

    let mut train_sampler = DistributedSampler::new(bundle.train.len(), &ctx, true, options.seed);
    // validation stats are all-reduced, so every video must be seen exactly once
    let val_sampler = DistributedSampler::new(bundle.val.len(), &ctx, false, options.seed);
    let val_loader = build_loader::<B::InnerBackend, _>(
        SampledDataset::new(bundle.val.clone(), val_sampler.unpadded_indices()),
        batcher.clone(),
        batch_size,
        options.num_workers,
        &device,
    );
    info!(
        "Data loaded with {} train and {} val videos",
        bundle.train.num_videos(),
        bundle.val.num_videos()
    );

    // ============ building network ... ============
    let backbone = BackboneConfig::for_architecture(options.arch, config, options.patch_size)?;
    let mut model = VideoClassifier::<B>::new(&backbone, &device);
    info!("Model {} built, embed dim {}", options.arch, model.embed_dim());

    match &options.pretrained_weights {
        Some(path) => {
            let (loaded, _) = model.load_pretrained_file(path, &options.checkpoint_key)?;
            model = loaded;
        }
        None => warn!("No pretrained weights given, fine-tuning from random initialisation"),
    }

    // ============ preparing optimizer ... ============
    let lr = scaled_learning_rate(
        options.lr,
        batch_size,
        ctx.world_size,
        config.solver.reference_batch_size,
    );
    let optimizer = build_optimizer::<B, VideoClassifier<B>>(&config.solver);
    let fresh_scheduler = MultiStepLr::from_solver(lr, &config.solver)?;
    info!(
        "Learning rate {lr:.6} (base {} x global batch {} / {})",
        options.lr,
        batch_size * ctx.world_size,
        config.solver.reference_batch_size
    );

    // ============ optionally resume training ... ============
    let checkpoint = TrainingCheckpoint::new(&options.output_dir);
    let restored = checkpoint.restore::<B, _, _>(model, optimizer, &device)?;
    let (mut scheduler, start_epoch, mut best_acc) = match restored.header {
        Some(header) => (header.scheduler, header.epoch, header.best_acc),
        None => (fresh_scheduler, 0, 0.0f64),
    };
    let (mut model, mut optimizer) = (restored.model, restored.optimizer);

    let run_log = RunLog::new(&options.output_dir);
    let val_freq = options.val_freq.max(1);
    let mut last_validation = None;

    info!("Starting training at epoch {start_epoch} of {}", options.epochs);
    for epoch in start_epoch..options.epochs {
        train_sampler.set_epoch(epoch);
        let indices = train_sampler.indices();
        let num_batches = indices.len().div_ceil(batch_size);
        let train_loader = build_loader::<B, _>(
            SampledDataset::new(bundle.train.clone(), indices),
            batcher.clone(),
            batch_size,
            options.num_workers,
            &device,
        );

        let (trained, train_stats) = train_one_epoch(
            model,
            &mut optimizer,
            train_loader.iter(),
            num_batches,
            epoch,
            scheduler.lr(),
            collective,
        )?;
        model = trained;
        scheduler.step();

        let test_stats = if epoch % val_freq == 0 || epoch + 1 == options.epochs {
            let stats = validate(&model.valid(), val_loader.iter(), collective)?;
            info!(
                "Accuracy at epoch {epoch} of the network on the {} test videos: {:.1}%",
                stats.samples, stats.acc1
            );
            best_acc = best_acc.max(stats.acc1);
            info!("Max accuracy so far: {best_acc:.2}%");
            Some(stats)
        } else {
            None
        };
        if let Some(stats) = test_stats {
            last_validation = Some(stats);
        }

        run_log.append(role, &epoch_log_entry(epoch, &train_stats, test_stats.as_ref()))?;
        let header = CheckpointHeader::new(
            epoch + 1,
            best_acc,
            scheduler.clone(),
            options.arch,
            config.model.num_classes,
        );
        checkpoint.save::<B, _, _>(role, &model, &optimizer, &header)?;
        collective.barrier()?;
    }

    // ============ multi-view test ... ============
    // every rank scores the whole set; the meter has no cross-rank reduction
    let multi_view = &bundle.multi_view;
    let multi_view_loader = build_loader::<B::InnerBackend, _>(
        multi_view.clone(),
        batcher,
        batch_size,
        options.num_workers,
        &device,
    );
    let total_batches = multi_view.len().div_ceil(batch_size);

    let mut meter = MultiViewMeter::new(
        multi_view.num_videos(),
        bundle.multi_view_config.views_per_video(),
        config.model.num_classes,
        config.data.ensemble_method,
        config.test.incomplete_policy,
    )
    .with_log_period(config.test.log_period);
    let multi_view_stats = test_multi_view(&model.valid(), multi_view_loader.iter(), &mut meter, |done| {
        on_test_batch(done, total_batches)
    })?;

    Ok(FinetuneSummary {
        start_epoch,
        epochs: options.epochs,
        best_acc,
        last_validation,
        multi_view: multi_view_stats,
    })
}
