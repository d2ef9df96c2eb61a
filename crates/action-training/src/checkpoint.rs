//! Training checkpoints: model, optimizer and scheduler state.
//!
//! A checkpoint lives in the run's output directory as three files:
//! - `checkpoint.json`: epoch counter, best accuracy, scheduler state
//! - `checkpoint.model.mpk`: model parameters
//! - `checkpoint.optim.mpk`: optimizer state (momentum buffers)
//!
//! Only the coordinator writes. Every rank restores.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use action_core::{Architecture, Error, Result, Role};

use crate::lr_schedule::MultiStepLr;

const HEADER_FILE: &str = "checkpoint.json";
const MODEL_STEM: &str = "checkpoint.model";
const OPTIM_STEM: &str = "checkpoint.optim";

/// Scalar training state stored next to the tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// First epoch to run after resuming
    pub epoch: usize,
    pub best_acc: f64,
    pub scheduler: MultiStepLr,
    pub arch: Architecture,
    pub num_classes: usize,
    pub saved_at: String,
}

impl CheckpointHeader {
    pub fn new(epoch: usize, best_acc: f64, scheduler: MultiStepLr, arch: Architecture, num_classes: usize) -> Self {
        Self {
            epoch,
            best_acc,
            scheduler,
            arch,
            num_classes,
            saved_at: Utc::now().to_rfc3339(),
        }
    }
}

/// State handed back by [`TrainingCheckpoint::restore`]
pub struct Restored<M, O> {
    pub model: M,
    pub optimizer: O,
    /// `None` when there was nothing to resume; model and optimizer are then
    /// returned untouched
    pub header: Option<CheckpointHeader>,
}

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Checkpoint files of one run directory
#[derive(Debug, Clone)]
pub struct TrainingCheckpoint {
    dir: PathBuf,
}

impl TrainingCheckpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header_path(&self) -> PathBuf {
        self.dir.join(HEADER_FILE)
    }

    pub fn exists(&self) -> bool {
        self.header_path().is_file()
    }

    /// Write model, optimizer and header. No-op for workers.
    pub fn save<B, M, O>(&self, role: Role, model: &M, optimizer: &O, header: &CheckpointHeader) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if !role.is_coordinator() {
            debug!("Skipping checkpoint save on worker");
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;

        let recorder = CheckpointRecorder::new();
        model
            .clone()
            .save_file(self.dir.join(MODEL_STEM), &recorder)
            .map_err(|e| Error::Checkpoint(format!("Failed to save model state: {:?}", e)))?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), self.dir.join(OPTIM_STEM))
            .map_err(|e| Error::Checkpoint(format!("Failed to save optimizer state: {:?}", e)))?;

        // Header last: its presence marks a complete checkpoint
        let json = serde_json::to_string_pretty(header)?;
        fs::write(self.header_path(), json)?;

        info!("Checkpoint saved to {:?} (next epoch {})", self.dir, header.epoch);
        Ok(())
    }

    /// Load the checkpoint into `model` and `optimizer`. Without a checkpoint
    /// both come back as given and the header is `None`.
    pub fn restore<B, M, O>(&self, model: M, optimizer: O, device: &B::Device) -> Result<Restored<M, O>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if !self.exists() {
            info!("No checkpoint found in {:?}, starting from scratch", self.dir);
            return Ok(Restored {
                model,
                optimizer,
                header: None,
            });
        }

        let json = fs::read_to_string(self.header_path())?;
        let header: CheckpointHeader = serde_json::from_str(&json)
            .map_err(|e| Error::Checkpoint(format!("Invalid checkpoint header: {}", e)))?;

        let recorder = CheckpointRecorder::new();
        let model = model
            .load_file(self.dir.join(MODEL_STEM), &recorder, device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load model state: {:?}", e)))?;
        let record = Recorder::<B>::load(&recorder, self.dir.join(OPTIM_STEM), device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load optimizer state: {:?}", e)))?;
        let optimizer = optimizer.load_record(record);

        info!(
            "Resumed from {:?}: epoch {}, best acc {:.2}%, saved {}",
            self.dir, header.epoch, header.best_acc, header.saved_at
        );
        Ok(Restored {
            model,
            optimizer,
            header: Some(header),
        })
    }
}
