//! Core type definitions shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Supported action-recognition datasets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatasetName {
    /// UCF101 (101 classes)
    Ucf101,
    /// HMDB51 (51 classes)
    Hmdb51,
    /// Kinetics-400 (400 classes)
    Kinetics400,
}

impl DatasetName {
    pub const ALL: [DatasetName; 3] = [Self::Ucf101, Self::Hmdb51, Self::Kinetics400];

    /// Number of action classes in the official label set
    pub fn num_classes(&self) -> usize {
        match self {
            DatasetName::Ucf101 => 101,
            DatasetName::Hmdb51 => 51,
            DatasetName::Kinetics400 => 400,
        }
    }

    /// Spatial crops used by the multi-view evaluation set
    pub fn multi_view_spatial_crops(&self) -> usize {
        3
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetName::Ucf101 => write!(f, "ucf101"),
            DatasetName::Hmdb51 => write!(f, "hmdb51"),
            DatasetName::Kinetics400 => write!(f, "kinetics400"),
        }
    }
}

impl FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ucf101" => Ok(DatasetName::Ucf101),
            "hmdb51" => Ok(DatasetName::Hmdb51),
            "kinetics400" | "kinetics" => Ok(DatasetName::Kinetics400),
            other => Err(Error::Config(format!(
                "unsupported dataset '{other}' (expected one of ucf101, hmdb51, kinetics400)"
            ))),
        }
    }
}

/// Backbone architecture tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// ViT-Tiny/16 with divided space-time attention
    VitTiny,
    /// ViT-Small/16 with divided space-time attention
    VitSmall,
    /// ViT-Base/16 with divided space-time attention
    VitBase,
    /// Video Swin Transformer (base width)
    Swin,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [Self::VitTiny, Self::VitSmall, Self::VitBase, Self::Swin];

    /// Width of the pooled feature the classification head consumes
    pub fn embed_dim(&self) -> usize {
        match self {
            Architecture::VitTiny => 192,
            Architecture::VitSmall => 384,
            Architecture::VitBase => 768,
            Architecture::Swin => 1024,
        }
    }

    pub fn is_vit(&self) -> bool {
        !matches!(self, Architecture::Swin)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::VitTiny => write!(f, "vit_tiny"),
            Architecture::VitSmall => write!(f, "vit_small"),
            Architecture::VitBase => write!(f, "vit_base"),
            Architecture::Swin => write!(f, "swin"),
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vit_tiny" => Ok(Architecture::VitTiny),
            "vit_small" => Ok(Architecture::VitSmall),
            "vit_base" => Ok(Architecture::VitBase),
            "swin" => Ok(Architecture::Swin),
            other => Err(Error::Config(format!(
                "unsupported architecture '{other}' (expected one of vit_tiny, vit_small, vit_base, swin)"
            ))),
        }
    }
}

/// Data split type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataSplit {
    /// Training data
    Train,
    /// Validation data
    Val,
    /// Test data
    Test,
}

impl DataSplit {
    /// File stem of the split annotation file (`train.csv`, ...)
    pub fn file_stem(&self) -> &'static str {
        match self {
            DataSplit::Train => "train",
            DataSplit::Val => "val",
            DataSplit::Test => "test",
        }
    }
}

impl fmt::Display for DataSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// How per-view predictions of one video are combined
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnsembleMethod {
    /// Sum of logits
    #[default]
    Sum,
    /// Mean of softmax probabilities
    Mean,
    /// Element-wise max of logits
    Max,
}

impl fmt::Display for EnsembleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsembleMethod::Sum => write!(f, "sum"),
            EnsembleMethod::Mean => write!(f, "mean"),
            EnsembleMethod::Max => write!(f, "max"),
        }
    }
}

/// What to do with videos that did not receive every expected view
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IncompletePolicy {
    /// Exclude incomplete videos from the final statistics
    #[default]
    Drop,
    /// Combine whatever views arrived
    Partial,
}

impl fmt::Display for IncompletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompletePolicy::Drop => write!(f, "drop"),
            IncompletePolicy::Partial => write!(f, "partial"),
        }
    }
}

/// Whether a forward pass runs with training-time stochasticity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Dropout and drop-path active
    Train,
    /// Deterministic inference
    Eval,
}

impl ForwardMode {
    pub fn is_train(&self) -> bool {
        matches!(self, ForwardMode::Train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_name_roundtrip() {
        for name in DatasetName::ALL {
            let parsed: DatasetName = name.to_string().parse().unwrap();
            assert_eq!(parsed, name);
        }
    }

    #[test]
    fn test_unknown_dataset_is_config_error() {
        let err = "something-v2".parse::<DatasetName>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_multi_view_uses_three_crops_for_every_dataset() {
        for name in DatasetName::ALL {
            assert_eq!(name.multi_view_spatial_crops(), 3, "{name}");
        }
    }

    #[test]
    fn test_architecture_widths() {
        assert_eq!(Architecture::VitTiny.embed_dim(), 192);
        assert_eq!(Architecture::VitSmall.embed_dim(), 384);
        assert_eq!(Architecture::VitBase.embed_dim(), 768);
        assert_eq!(Architecture::Swin.embed_dim(), 1024);
    }

    #[test]
    fn test_unknown_architecture_is_config_error() {
        assert!(matches!("resnet50".parse::<Architecture>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_ensemble_method_serde() {
        let method: EnsembleMethod = serde_json::from_str("\"mean\"").unwrap();
        assert_eq!(method, EnsembleMethod::Mean);
        assert_eq!(EnsembleMethod::default(), EnsembleMethod::Sum);
    }
}
