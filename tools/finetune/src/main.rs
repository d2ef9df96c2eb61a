//! Fine-tuning CLI Tool
//!
//! Fine-tunes a pretrained ViT or Swin backbone on UCF101, HMDB51 or
//! Kinetics400, validates every `--val-freq` epochs and finishes with a
//! multi-view test.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::info;

use action_core::cli::{git_revision, load_run_config, setup_cli_logging};
use action_core::{Architecture, DistributedContext, LocalCollective, RunConfig};
use action_training::backend::{backend_name, TrainingBackend};
use action_training::run_log::write_config_json;
use action_training::{run_finetune, FinetuneOptions, FinetuneSummary};

/// Video action-recognition fine-tuning
#[derive(Parser, Debug, Clone, Serialize)]
#[command(
    name = "finetune",
    about = "Fine-tune pretrained video backbones on action recognition datasets",
    long_about = "Fine-tune a pretrained ViT (divided space-time attention) or Video Swin \
                  backbone with SGD, validating on single centre clips and finishing with \
                  multi-view test aggregation."
)]
struct Args {
    /// Backbone architecture (vit_tiny, vit_small, vit_base, swin)
    #[arg(long, default_value = "vit_small")]
    arch: Architecture,

    /// Patch resolution of the ViT backbone
    #[arg(long, default_value_t = 16)]
    patch_size: usize,

    /// Pretrained weights to evaluate (safetensors)
    #[arg(long, value_name = "FILE")]
    pretrained_weights: Option<PathBuf>,

    /// Key of the backbone inside the pretrained checkpoint
    #[arg(long, default_value = "teacher")]
    checkpoint_key: String,

    /// Concatenate class tokens of the n last blocks (recorded only)
    #[arg(long, default_value_t = 4)]
    n_last_blocks: usize,

    /// Concatenate the averaged patch tokens (recorded only)
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    avgpool_patchtokens: bool,

    /// Number of epochs of training
    #[arg(long, default_value_t = 100)]
    epochs: usize,

    /// Learning rate at the beginning of training, scaled with the global batch size
    #[arg(long, default_value_t = 0.001)]
    lr: f64,

    /// Per-process batch size
    #[arg(long, default_value_t = 128)]
    batch_size_per_gpu: usize,

    /// Number of data loading workers per process
    #[arg(long, default_value_t = 10)]
    num_workers: usize,

    /// Epoch frequency for validation
    #[arg(long, default_value_t = 1)]
    val_freq: usize,

    /// Path to save logs and checkpoints
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Number of labels for the classification head
    #[arg(long, default_value_t = 1000)]
    num_labels: usize,

    /// Dataset to fine-tune on (ucf101, hmdb51, kinetics400)
    #[arg(long, default_value = "ucf101")]
    dataset: String,

    /// Feed a second (flow) token to the ViT backbone
    #[arg(long)]
    use_flow: bool,

    /// Path to the YAML run config
    #[arg(long, value_name = "FILE")]
    cfg: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config overrides as KEY VALUE pairs, e.g. TEST.NUM_ENSEMBLE_VIEWS 5
    #[arg(long, num_args = 1.., allow_hyphen_values = true, trailing_var_arg = true)]
    opts: Vec<String>,
}

impl Args {
    fn finetune_options(&self) -> FinetuneOptions {
        FinetuneOptions {
            arch: self.arch,
            patch_size: self.patch_size,
            pretrained_weights: self.pretrained_weights.clone(),
            checkpoint_key: self.checkpoint_key.clone(),
            n_last_blocks: self.n_last_blocks,
            avgpool_patchtokens: self.avgpool_patchtokens,
            epochs: self.epochs,
            lr: self.lr,
            batch_size_per_gpu: self.batch_size_per_gpu,
            num_workers: self.num_workers,
            val_freq: self.val_freq,
            output_dir: self.output_dir.clone(),
            dataset: self.dataset.clone(),
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("Video Action Recognition - Fine-tuning Tool");
    info!("============================================");
    info!("git: {}", git_revision());
    print_args(&args)?;

    let ctx = DistributedContext::from_env().context("Failed to read distributed environment")?;
    if ctx.world_size > 1 {
        bail!(
            "WORLD_SIZE={} requested, but this binary runs a single process; \
             launch without a distributed environment",
            ctx.world_size
        );
    }

    let config = resolve_config(&args)?;
    print_config_summary(&args, &config);

    write_config_json(ctx.role(), &args.output_dir, &args)
        .context("Failed to save run arguments")?;

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} test batches ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );

    let summary = run_finetune::<TrainingBackend>(
        &args.finetune_options(),
        &config,
        &LocalCollective,
        |done, total| {
            progress.set_length(total as u64);
            progress.set_position(done as u64);
        },
    )
    .context("Fine-tuning failed")?;
    progress.finish_and_clear();

    print_summary(&summary);
    Ok(())
}

/// Merge the YAML config, `--opts` overrides and the flags that own config keys.
fn resolve_config(args: &Args) -> Result<RunConfig> {
    let mut config = load_run_config(args.cfg.as_deref(), &args.opts)
        .context("Failed to load run configuration")?;

    if config.model.num_classes != args.num_labels {
        info!(
            "MODEL.NUM_CLASSES {} replaced by --num-labels {}",
            config.model.num_classes, args.num_labels
        );
    }
    config.model.num_classes = args.num_labels;
    config.data.use_flow |= args.use_flow;

    config.validate().context("Invalid run configuration")?;
    Ok(config)
}

fn print_args(args: &Args) -> Result<()> {
    let value = serde_json::to_value(args)?;
    if let Some(fields) = value.as_object() {
        // serde_json maps are ordered by key
        for (name, value) in fields {
            info!("{name}: {value}");
        }
    }
    Ok(())
}

fn print_config_summary(args: &Args, config: &RunConfig) {
    info!("");
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    if args.arch.is_vit() {
        info!("  Model: {} (patch {})", args.arch, args.patch_size);
    } else {
        info!("  Model: {}", args.arch);
    }
    info!("  Dataset: {}", args.dataset);
    info!("  Classes: {}", config.model.num_classes);
    info!("  Clip: {} frames, sampling rate {}", config.data.num_frames, config.data.sampling_rate);
    info!("  Crop: train {} / test {}", config.data.train_crop_size, config.data.test_crop_size);
    info!("  Epochs: {}", args.epochs);
    info!("  Batch size per process: {}", args.batch_size_per_gpu);
    info!("  Learning rate: {}", args.lr);
    info!("  Milestones: {:?} (gamma {})", config.solver.milestones, config.solver.gamma);
    info!(
        "  Test views: {} temporal x {} spatial",
        config.test.num_ensemble_views, config.test.num_spatial_crops
    );
    info!("  Output dir: {}", args.output_dir.display());
    info!("");
}

fn print_summary(summary: &FinetuneSummary) {
    let multi_view = &summary.multi_view;

    println!();
    println!("{}", "Fine-tuning Summary".bold().green());
    println!("{}", "===================".green());
    println!("  Epochs run: {}..{}", summary.start_epoch, summary.epochs);
    if let Some(last) = &summary.last_validation {
        println!(
            "  Last validation: acc@1 {:.2}%, loss {:.4} ({} clips)",
            last.acc1, last.loss, last.samples
        );
    }
    println!(
        "  Multi-view: top-1 {}  top-5 {}  ({} videos)",
        format!("{:.2}%", multi_view.top1).cyan(),
        multi_view
            .top5
            .map(|top5| format!("{top5:.2}%"))
            .unwrap_or_else(|| "n/a".into())
            .cyan(),
        multi_view.num_videos
    );
    if multi_view.num_incomplete > 0 || multi_view.num_missing > 0 {
        println!(
            "  {}",
            format!(
                "{} videos with missing views, {} videos never seen",
                multi_view.num_incomplete, multi_view.num_missing
            )
            .yellow()
        );
    }
    println!(
        "{}",
        format!("Top-1 test accuracy: {:.1}", summary.best_acc).bold()
    );
}
