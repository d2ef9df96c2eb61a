//! Video classifiers: a transformer backbone plus a linear head.
//!
//! Implements:
//! - ViT with divided space-time attention (tiny, small, base)
//! - 3D Swin Transformer
//! - Unified `VideoClassifier` interface with named-weight import/export

pub mod layers;
pub mod swin;
pub mod vit;

use std::path::Path;

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use action_core::{Architecture, Error, ForwardMode, Result, RunConfig};

use crate::weights::{join_key, LoadReport, NamedWeights, StateDict, WeightLoader};
use layers::train_dropout;
pub use swin::{SwinConfig, SwinTransformer3D};
pub use vit::{VisionTransformer, VitConfig};

/// Prefix of backbone tensors inside a pretraining checkpoint entry
pub const BACKBONE_PREFIX: &str = "backbone.";

/// Anything mapping a clip batch `[b, c, t, h, w]` to logits `[b, classes]`
pub trait ClipClassifier<B: Backend> {
    fn classify(&self, clips: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 2>;
}

/// Backbone geometry
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneKind {
    Vit(VitConfig),
    Swin(SwinConfig),
}

/// Resolved network configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneConfig {
    pub arch: Architecture,
    pub kind: BackboneKind,
    pub num_classes: usize,
    /// Dropout before the head
    pub dropout_rate: f64,
}

impl BackboneConfig {
    /// Resolve the geometry of `arch` from the run configuration.
    ///
    /// `MODEL.EMBED_DIM`, `MODEL.DEPTH` and `MODEL.NUM_HEADS` override the
    /// architecture defaults. For Swin they set the first stage's width,
    /// every stage's depth and the first stage's heads (doubling per stage).
    pub fn for_architecture(arch: Architecture, config: &RunConfig, patch_size: usize) -> Result<Self> {
        let model = &config.model;
        let data = &config.data;

        let kind = match arch {
            Architecture::Swin => {
                let defaults = SwinConfig::default();
                let stages = defaults.depths.len();
                let heads = model.num_heads.unwrap_or(defaults.num_heads[0]);
                let swin = SwinConfig {
                    embed_dim: model.embed_dim.unwrap_or(defaults.embed_dim),
                    depths: model.depth.map(|d| vec![d; stages]).unwrap_or(defaults.depths),
                    num_heads: (0..stages).map(|stage| heads << stage).collect(),
                    drop_rate: model.dropout_rate,
                    drop_path_rate: model.drop_path_rate,
                    ..defaults
                };
                swin.validate()?;
                BackboneKind::Swin(swin)
            }
            vit_arch => {
                if data.train_crop_size != data.test_crop_size {
                    return Err(Error::Config(format!(
                        "ViT position embeddings need TRAIN_CROP_SIZE ({}) == TEST_CROP_SIZE ({})",
                        data.train_crop_size, data.test_crop_size
                    )));
                }
                let (depth, heads) = match vit_arch {
                    Architecture::VitTiny => (12, 3),
                    Architecture::VitSmall => (12, 6),
                    _ => (12, 12),
                };
                let vit = VitConfig {
                    img_size: data.train_crop_size as usize,
                    patch_size,
                    in_chans: 3,
                    num_frames: data.num_frames,
                    embed_dim: model.embed_dim.unwrap_or(vit_arch.embed_dim()),
                    depth: model.depth.unwrap_or(depth),
                    num_heads: model.num_heads.unwrap_or(heads),
                    mlp_ratio: 4,
                    qkv_bias: true,
                    drop_rate: model.dropout_rate,
                    drop_path_rate: model.drop_path_rate,
                    two_token: model.two_token || data.use_flow,
                };
                vit.validate()?;
                BackboneKind::Vit(vit)
            }
        };

        if model.num_classes == 0 {
            return Err(Error::Config("MODEL.NUM_CLASSES must be positive".into()));
        }

        Ok(Self {
            arch,
            kind,
            num_classes: model.num_classes,
            dropout_rate: model.dropout_rate,
        })
    }

    /// Width of the feature the head consumes
    pub fn embed_dim(&self) -> usize {
        match &self.kind {
            BackboneKind::Vit(vit) => vit.output_dim(),
            BackboneKind::Swin(swin) => swin.output_dim(),
        }
    }
}

#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Vit(VisionTransformer<B>),
    Swin(SwinTransformer3D<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward_features(&self, clips: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 2> {
        match self {
            Backbone::Vit(model) => model.forward_features(clips, mode),
            Backbone::Swin(model) => model.forward_features(clips, mode),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Backbone::Vit(model) => model.output_dim(),
            Backbone::Swin(model) => model.output_dim(),
        }
    }
}

impl<B: Backend> NamedWeights<B> for Backbone<B> {
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()> {
        match self {
            Backbone::Vit(model) => model.export_weights(prefix, out),
            Backbone::Swin(model) => model.export_weights(prefix, out),
        }
    }

    fn import_weights(self, prefix: &str, loader: &mut WeightLoader) -> Self {
        match self {
            Backbone::Vit(model) => Backbone::Vit(model.import_weights(prefix, loader)),
            Backbone::Swin(model) => Backbone::Swin(model.import_weights(prefix, loader)),
        }
    }
}

/// Video action classifier
#[derive(Module, Debug)]
pub struct VideoClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: Linear<B>,
    head_drop: Dropout,
    num_classes: usize,
}

impl<B: Backend> VideoClassifier<B> {
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Self {
        let backbone = match &config.kind {
            BackboneKind::Vit(vit) => Backbone::Vit(VisionTransformer::new(vit, device)),
            BackboneKind::Swin(swin) => Backbone::Swin(SwinTransformer3D::new(swin, device)),
        };
        let head = LinearConfig::new(backbone.output_dim(), config.num_classes).init(device);

        Self {
            backbone,
            head,
            head_drop: DropoutConfig::new(config.dropout_rate).init(),
            num_classes: config.num_classes,
        }
    }

    /// Width of the backbone feature
    pub fn embed_dim(&self) -> usize {
        self.backbone.output_dim()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, clips: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 2> {
        let features = self.backbone.forward_features(clips, mode);
        self.head.forward(train_dropout(&self.head_drop, features, mode))
    }

    /// All parameters by name; backbone tensors at the top level, the
    /// classifier under `head`
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut dict = StateDict::new();
        self.backbone.export_weights("", &mut dict)?;
        self.head.export_weights("head", &mut dict)?;
        Ok(dict)
    }

    /// Non-strict load of every parameter, head included
    pub fn load_state_dict(self, state: StateDict) -> (Self, LoadReport) {
        let mut loader = WeightLoader::new(state);
        let backbone = self.backbone.import_weights("", &mut loader);
        let head = self.head.import_weights(&join_key("", "head"), &mut loader);
        let model = Self { backbone, head, ..self };
        (model, loader.finish())
    }

    /// Non-strict load of backbone parameters; the head keeps its
    /// initialisation.
    pub fn load_pretrained(self, state: StateDict) -> (Self, LoadReport) {
        let mut loader = WeightLoader::new(state);
        let backbone = self.backbone.import_weights("", &mut loader);
        (Self { backbone, ..self }, loader.finish())
    }

    /// Read a pretraining checkpoint, take `checkpoint_key` if present, keep
    /// the `backbone.` tensors and load them.
    pub fn load_pretrained_file(self, path: &Path, checkpoint_key: &str) -> Result<(Self, LoadReport)> {
        let state = StateDict::from_safetensors_file(path)?
            .select_entry(checkpoint_key)
            .strip_prefix(BACKBONE_PREFIX);
        let (model, report) = self.load_pretrained(state);
        info!("Pretrained weights found at {}", path.display());
        report.log();
        Ok((model, report))
    }
}

impl<B: Backend> ClipClassifier<B> for VideoClassifier<B> {
    fn classify(&self, clips: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 2> {
        self.forward(clips, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn small_config(depth: usize) -> RunConfig {
        let mut config = RunConfig::default();
        config.data.train_crop_size = 32;
        config.data.test_crop_size = 32;
        config.data.num_frames = 2;
        config.model.depth = Some(depth);
        config.model.num_classes = 5;
        config
    }

    fn tiny_vit_config() -> BackboneConfig {
        let mut config = small_config(1);
        config.model.embed_dim = Some(16);
        config.model.num_heads = Some(2);
        BackboneConfig::for_architecture(Architecture::VitTiny, &config, 16).unwrap()
    }

    #[test]
    fn test_embed_dim_per_architecture() {
        let device = Default::default();
        let config = small_config(1);
        for arch in Architecture::ALL {
            let backbone = BackboneConfig::for_architecture(arch, &config, 16).unwrap();
            assert_eq!(backbone.embed_dim(), arch.embed_dim(), "{arch}");

            let model = VideoClassifier::<TestBackend>::new(&backbone, &device);
            assert_eq!(model.embed_dim(), arch.embed_dim(), "{arch}");
            assert_eq!(model.num_classes(), 5);
        }
    }

    #[test]
    fn test_two_token_reports_double_width() {
        let mut config = small_config(1);
        config.data.use_flow = true;
        let backbone = BackboneConfig::for_architecture(Architecture::VitSmall, &config, 16).unwrap();
        assert_eq!(backbone.embed_dim(), 768);
    }

    #[test]
    fn test_mismatched_crop_sizes_rejected_for_vit() {
        let mut config = small_config(1);
        config.data.test_crop_size = 64;
        assert!(BackboneConfig::for_architecture(Architecture::VitTiny, &config, 16).is_err());
        assert!(BackboneConfig::for_architecture(Architecture::Swin, &config, 16).is_ok());
    }

    #[test]
    fn test_forward_logits_shape() {
        let device = Default::default();
        let model = VideoClassifier::<TestBackend>::new(&tiny_vit_config(), &device);
        let clips = Tensor::<TestBackend, 5>::random([3, 3, 2, 32, 32], Distribution::Default, &device);
        assert_eq!(model.forward(clips, ForwardMode::Eval).dims(), [3, 5]);
    }

    #[test]
    fn test_pretrained_backbone_keys_load_exactly() {
        let device = Default::default();
        let config = tiny_vit_config();
        let source = VideoClassifier::<TestBackend>::new(&config, &device);

        // Checkpoint layout: {"teacher": {"backbone.<name>": ...}}
        let mut checkpoint = StateDict::new();
        for (name, tensor) in source.state_dict().unwrap().iter() {
            if !name.starts_with("head.") {
                checkpoint
                    .insert(format!("teacher.backbone.{name}"), tensor.shape.clone(), tensor.values.clone())
                    .unwrap();
            }
        }
        checkpoint.insert("teacher.head.last_layer.weight", vec![2, 2], vec![0.0; 4]).unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pretrain.safetensors");
        checkpoint.save_safetensors(&path).unwrap();

        let target = VideoClassifier::<TestBackend>::new(&config, &device);
        let (target, report) = target.load_pretrained_file(&path, "teacher").unwrap();
        assert!(report.missing.is_empty(), "{:?}", report.missing);
        assert!(report.unexpected.is_empty(), "{:?}", report.unexpected);
        assert!(report.mismatched.is_empty());

        let loaded = target.state_dict().unwrap();
        let expected = source.state_dict().unwrap();
        assert_eq!(loaded.get("pos_embed"), expected.get("pos_embed"));
        assert_eq!(
            loaded.get("blocks.0.attn.qkv.weight"),
            expected.get("blocks.0.attn.qkv.weight")
        );
    }

    #[test]
    fn test_wrong_prefix_loads_nothing() {
        let device = Default::default();
        let config = tiny_vit_config();
        let model = VideoClassifier::<TestBackend>::new(&config, &device);
        let state = model.state_dict().unwrap().with_prefix("module.").strip_prefix(BACKBONE_PREFIX);

        let (_, report) = model.load_pretrained(state);
        assert!(report.loaded.is_empty());
        assert!(!report.missing.is_empty());
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let device = Default::default();
        let config = tiny_vit_config();
        let a = VideoClassifier::<TestBackend>::new(&config, &device);
        let b = VideoClassifier::<TestBackend>::new(&config, &device);

        let (b, report) = b.load_state_dict(a.state_dict().unwrap());
        assert!(report.is_exact());
        assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
    }
}
