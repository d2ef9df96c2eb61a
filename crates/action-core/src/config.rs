//! Run configuration for fine-tuning.
//!
//! The layout mirrors the upper-case YAML files used for video models
//! (`DATA`, `MODEL`, `TEST`, `SOLVER`). Every field has a default so a
//! partial file, or no file at all, yields a usable configuration.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{EnsembleMethod, IncompletePolicy};
use crate::{Error, Result};

/// Merged run settings, built once at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunConfig {
    #[serde(rename = "DATA")]
    pub data: DataConfig,
    #[serde(rename = "MODEL")]
    pub model: ModelConfig,
    #[serde(rename = "TEST")]
    pub test: TestConfig,
    #[serde(rename = "SOLVER")]
    pub solver: SolverConfig,
}

/// Dataset and clip sampling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DataConfig {
    /// Directory holding `train.csv`, `val.csv`, `test.csv`
    pub path_to_data_dir: PathBuf,
    /// Root prepended to every video path of a split file
    pub path_prefix: PathBuf,
    /// Separator between path and label in split files
    pub path_label_separator: String,
    /// Frames per clip
    pub num_frames: usize,
    /// Stride between sampled frames
    pub sampling_rate: usize,
    /// Short-side scale range for training crops
    pub train_jitter_scales: [u32; 2],
    pub train_crop_size: u32,
    pub test_crop_size: u32,
    /// Random horizontal flip during training
    pub random_flip: bool,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// How multi-view predictions are combined
    pub ensemble_method: EnsembleMethod,
    pub multi_label: bool,
    pub use_flow: bool,
    /// Accepted frame file extensions (lower case)
    pub frame_extensions: Vec<String>,
    /// Attempts before giving up on a video that fails to decode
    pub decode_retries: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path_to_data_dir: PathBuf::new(),
            path_prefix: PathBuf::new(),
            path_label_separator: String::from(" "),
            num_frames: 8,
            sampling_rate: 8,
            train_jitter_scales: [256, 320],
            train_crop_size: 224,
            test_crop_size: 224,
            random_flip: true,
            mean: [0.45, 0.45, 0.45],
            std: [0.225, 0.225, 0.225],
            ensemble_method: EnsembleMethod::Sum,
            multi_label: false,
            use_flow: false,
            frame_extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            decode_retries: 10,
        }
    }
}

/// Model head and regularisation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ModelConfig {
    pub num_classes: usize,
    /// Dropout before the classification head
    pub dropout_rate: f64,
    /// Stochastic depth rate, linearly increased over the blocks
    pub drop_path_rate: f64,
    /// Extra auxiliary class token (ViT only); doubles the head width
    pub two_token: bool,
    /// Overrides the architecture's embedding width
    pub embed_dim: Option<usize>,
    /// Overrides the architecture's depth (ViT blocks, or blocks per Swin stage)
    pub depth: Option<usize>,
    /// Overrides the architecture's attention heads (ViT, or first Swin stage)
    pub num_heads: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 400,
            dropout_rate: 0.0,
            drop_path_rate: 0.1,
            two_token: false,
            embed_dim: None,
            depth: None,
            num_heads: None,
        }
    }
}

/// Multi-view evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TestConfig {
    /// Temporal clips per video
    pub num_ensemble_views: usize,
    /// Spatial crops per clip
    pub num_spatial_crops: usize,
    pub incomplete_policy: IncompletePolicy,
    /// Iterations between timing logs
    pub log_period: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            num_ensemble_views: 10,
            num_spatial_crops: 3,
            incomplete_policy: IncompletePolicy::Drop,
            log_period: 10,
        }
    }
}

/// SGD and learning-rate schedule settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SolverConfig {
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    /// Epochs after which the rate is multiplied by `gamma`
    pub milestones: Vec<usize>,
    pub gamma: f64,
    /// Global batch size the base rate is quoted for
    pub reference_batch_size: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            dampening: 0.0,
            weight_decay: 1e-4,
            milestones: vec![10, 13],
            gamma: 0.1,
            reference_batch_size: 256,
        }
    }
}

impl RunConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
    }

    /// Apply `KEY VALUE` pairs such as `TEST.NUM_ENSEMBLE_VIEWS 5`.
    ///
    /// Keys must already exist; values are parsed as YAML scalars or lists.
    pub fn apply_overrides(&mut self, opts: &[String]) -> Result<()> {
        if opts.len() % 2 != 0 {
            return Err(Error::Config(format!(
                "override list must contain KEY VALUE pairs, got {} items",
                opts.len()
            )));
        }

        let mut tree = serde_yaml::to_value(&*self)?;
        for pair in opts.chunks(2) {
            let (key, raw) = (&pair[0], &pair[1]);
            let value: Value = serde_yaml::from_str(raw)
                .map_err(|e| Error::Config(format!("bad value '{raw}' for {key}: {e}")))?;
            set_dotted(&mut tree, key, value)?;
        }

        *self = serde_yaml::from_value(tree)
            .map_err(|e| Error::Config(format!("override produced an invalid config: {e}")))?;
        Ok(())
    }

    /// Copy with `TEST.NUM_SPATIAL_CROPS` replaced.
    pub fn with_spatial_crops(&self, crops: usize) -> Self {
        let mut config = self.clone();
        config.test.num_spatial_crops = crops;
        config
    }

    /// Views each video contributes to the multi-view evaluation
    pub fn views_per_video(&self) -> usize {
        self.test.num_ensemble_views * self.test.num_spatial_crops
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.num_frames == 0 {
            return Err(Error::Config("DATA.NUM_FRAMES must be positive".into()));
        }
        if self.data.sampling_rate == 0 {
            return Err(Error::Config("DATA.SAMPLING_RATE must be positive".into()));
        }
        if self.data.train_crop_size == 0 || self.data.test_crop_size == 0 {
            return Err(Error::Config("crop sizes must be positive".into()));
        }
        let [min_scale, max_scale] = self.data.train_jitter_scales;
        if min_scale > max_scale || min_scale < self.data.train_crop_size {
            return Err(Error::Config(format!(
                "DATA.TRAIN_JITTER_SCALES {:?} must be ordered and not below the crop size {}",
                self.data.train_jitter_scales, self.data.train_crop_size
            )));
        }
        if self.data.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::Config("DATA.STD entries must be positive".into()));
        }
        if self.data.multi_label {
            return Err(Error::Config("DATA.MULTI_LABEL is not supported".into()));
        }
        if self.model.num_classes == 0 {
            return Err(Error::Config("MODEL.NUM_CLASSES must be positive".into()));
        }
        if self.test.num_ensemble_views == 0 || self.test.num_spatial_crops == 0 {
            return Err(Error::Config(
                "TEST.NUM_ENSEMBLE_VIEWS and TEST.NUM_SPATIAL_CROPS must be positive".into(),
            ));
        }
        if self.test.num_spatial_crops > 3 {
            return Err(Error::Config("TEST.NUM_SPATIAL_CROPS supports at most 3 crops".into()));
        }
        if self.solver.milestones.is_empty() || self.solver.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(format!(
                "SOLVER.MILESTONES must be non-empty and strictly increasing, got {:?}",
                self.solver.milestones
            )));
        }
        if self.solver.reference_batch_size == 0 {
            return Err(Error::Config("SOLVER.REFERENCE_BATCH_SIZE must be positive".into()));
        }
        Ok(())
    }
}

fn set_dotted(tree: &mut Value, key: &str, value: Value) -> Result<()> {
    let mut node = tree;
    let parts: Vec<&str> = key.split('.').collect();
    for (depth, part) in parts.iter().enumerate() {
        let mapping = node
            .as_mapping_mut()
            .ok_or_else(|| Error::Config(format!("override key {key}: '{part}' is not a section")))?;
        let slot = mapping
            .get_mut(Value::String((*part).to_string()))
            .ok_or_else(|| Error::Config(format!("unknown config key {key}")))?;
        if depth + 1 == parts.len() {
            *slot = value;
            return Ok(());
        }
        node = slot;
    }
    Err(Error::Config(format!("empty override key '{key}'")))
}
