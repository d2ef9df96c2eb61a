//! Named weights: safetensors state dicts and non-strict loading.
//!
//! Checkpoints use the upstream parameter naming (`blocks.0.attn.qkv.weight`)
//! and layout: linear and convolution weights are `[out, in, ...]`. Loading
//! transposes those into burn's `[in, out]` linear layout and flattens the
//! convolution kernels of the patch embeddings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use burn::module::Param;
use burn::nn::{LayerNorm, Linear};
use burn::prelude::*;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, warn};

use action_core::{Error, Result};

/// Host-side tensor in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Ordered mapping from parameter names to tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, SourceTensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Result<()> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(Error::Checkpoint(format!(
                "{name}: shape {shape:?} needs {expected} values, got {}",
                values.len()
            )));
        }
        self.tensors.insert(name, SourceTensor { shape, values });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SourceTensor> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SourceTensor> {
        self.tensors.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceTensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Unwrap a named sub-entry such as `teacher.` when the checkpoint holds
    /// several networks. Without any `{entry}.` key the dict is returned as is.
    pub fn select_entry(self, entry: &str) -> Self {
        let marker = format!("{entry}.");
        if entry.is_empty() || !self.tensors.keys().any(|k| k.starts_with(&marker)) {
            debug!("No '{entry}' entry in checkpoint, using top-level tensors");
            return self;
        }
        info!("Taking '{entry}' entry from checkpoint");
        self.strip_prefix(&marker)
    }

    /// Keep only keys starting with `prefix`, with the prefix removed.
    pub fn strip_prefix(self, prefix: &str) -> Self {
        let tensors = self
            .tensors
            .into_iter()
            .filter_map(|(name, tensor)| name.strip_prefix(prefix).map(|rest| (rest.to_string(), tensor)))
            .collect();
        Self { tensors }
    }

    /// Prepend `prefix` to every key.
    pub fn with_prefix(self, prefix: &str) -> Self {
        let tensors = self
            .tensors
            .into_iter()
            .map(|(name, tensor)| (format!("{prefix}{name}"), tensor))
            .collect();
        Self { tensors }
    }

    pub fn from_safetensors_bytes(bytes: &[u8]) -> Result<Self> {
        let file = SafeTensors::deserialize(bytes)?;
        let mut dict = Self::new();

        for (name, view) in file.tensors() {
            let values = decode_values(&name, view.dtype(), view.data())?;
            dict.insert(name, view.shape().to_vec(), values)?;
        }
        Ok(dict)
    }

    pub fn from_safetensors_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| Error::Checkpoint(format!("Failed to read weights {}: {e}", path.display())))?;
        let dict = Self::from_safetensors_bytes(&bytes)?;
        info!("Read {} tensors from {}", dict.len(), path.display());
        Ok(dict)
    }

    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let encoded: Vec<(&str, &[usize], Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, tensor)| {
                let bytes = tensor.values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.as_str(), tensor.shape.as_slice(), bytes)
            })
            .collect();

        let mut views = Vec::with_capacity(encoded.len());
        for (name, shape, bytes) in &encoded {
            let view = TensorView::new(Dtype::F32, shape.to_vec(), bytes)?;
            views.push((*name, view));
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        Ok(safetensors::serialize(views, &Some(metadata))?)
    }

    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_safetensors_bytes()?)?;
        Ok(())
    }
}

fn decode_values(name: &str, dtype: Dtype, data: &[u8]) -> Result<Vec<f32>> {
    match dtype {
        Dtype::F32 => Ok(data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        Dtype::F64 => Ok(data
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()),
        other => Err(Error::Checkpoint(format!(
            "{name}: unsupported dtype {other:?} (expected F32 or F64)"
        ))),
    }
}

/// Outcome of a non-strict load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Parameters the model has but the checkpoint lacks
    pub missing: Vec<String>,
    /// Checkpoint tensors no parameter asked for
    pub unexpected: Vec<String>,
    /// `(name, checkpoint shape, parameter shape)`
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn log(&self) {
        info!("{self}");
        if self.loaded.is_empty() {
            warn!(
                "NO pretrained parameters were loaded ({} missing, {} unexpected); check the checkpoint key and prefix",
                self.missing.len(),
                self.unexpected.len()
            );
        }
        if !self.missing.is_empty() {
            warn!("Missing keys: {:?}", self.missing);
        }
        if !self.unexpected.is_empty() {
            warn!("Unexpected keys: {:?}", self.unexpected);
        }
        for (name, found, expected) in &self.mismatched {
            warn!("Shape mismatch for {name}: checkpoint {found:?}, model {expected:?}");
        }
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Loaded {} tensors ({} missing, {} unexpected, {} shape mismatches)",
            self.loaded.len(),
            self.missing.len(),
            self.unexpected.len(),
            self.mismatched.len()
        )
    }
}

/// How a checkpoint tensor maps onto a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Same shape, same order
    Exact,
    /// `[out, in...]` in the checkpoint, `[in, out]` in the parameter
    Transposed,
}

/// Consumes a [`StateDict`] while modules pull their parameters from it.
#[derive(Debug)]
pub struct WeightLoader {
    state: StateDict,
    report: LoadReport,
}

impl WeightLoader {
    pub fn new(state: StateDict) -> Self {
        Self {
            state,
            report: LoadReport::default(),
        }
    }

    fn take(&mut self, key: &str, expected: &[usize], layout: Layout) -> Option<Vec<f32>> {
        let Some(source) = self.state.remove(key) else {
            self.report.missing.push(key.to_string());
            return None;
        };

        let values = match layout {
            Layout::Exact if source.shape == expected => Some(source.values),
            Layout::Transposed => transpose_to_linear(&source, expected),
            Layout::Exact => None,
        };

        match values {
            Some(values) => {
                self.report.loaded.push(key.to_string());
                Some(values)
            }
            None => {
                self.report
                    .mismatched
                    .push((key.to_string(), source.shape, expected.to_vec()));
                None
            }
        }
    }

    pub fn finish(self) -> LoadReport {
        let mut report = self.report;
        report.unexpected = self.state.keys().map(str::to_string).collect();
        report
    }
}

/// `[out, in...]` with `prod(in...) == expected[0]` into `[in, out]`.
fn transpose_to_linear(source: &SourceTensor, expected: &[usize]) -> Option<Vec<f32>> {
    let [d_in, d_out] = expected else {
        return None;
    };
    let (&out, rest) = source.shape.split_first()?;
    if out != *d_out || rest.iter().product::<usize>() != *d_in {
        return None;
    }

    let mut values = vec![0.0; d_in * d_out];
    for o in 0..*d_out {
        for i in 0..*d_in {
            values[i * d_out + o] = source.values[o * d_in + i];
        }
    }
    Some(values)
}

pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>, name: &str) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Model(format!("{name}: cannot read tensor data: {e:?}")))
}

fn replace_param<B: Backend, const D: usize>(param: Param<Tensor<B, D>>, values: Vec<f32>) -> Param<Tensor<B, D>> {
    let current = param.val();
    let tensor = Tensor::<B, D>::from_data(TensorData::new(values, current.dims()), &current.device());
    Param::initialized(param.id, tensor.require_grad())
}

/// Modules whose parameters can be exported to, and loaded from, a [`StateDict`].
pub trait NamedWeights<B: Backend>: Sized {
    /// Write every parameter under `prefix` in checkpoint layout.
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()>;

    /// Replace every parameter found under `prefix`; the rest keep their values.
    fn import_weights(self, prefix: &str, loader: &mut WeightLoader) -> Self;
}

impl<B: Backend, const D: usize> NamedWeights<B> for Param<Tensor<B, D>> {
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()> {
        let tensor = self.val();
        let shape = tensor.dims().to_vec();
        out.insert(prefix, shape, tensor_values(tensor, prefix)?)
    }

    fn import_weights(self, prefix: &str, loader: &mut WeightLoader) -> Self {
        let dims = self.val().dims();
        match loader.take(prefix, &dims, Layout::Exact) {
            Some(values) => replace_param(self, values),
            None => self,
        }
    }
}

impl<B: Backend> NamedWeights<B> for Linear<B> {
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()> {
        let weight = self.weight.val();
        let [d_in, d_out] = weight.dims();
        let key = join_key(prefix, "weight");
        out.insert(key.clone(), vec![d_out, d_in], tensor_values(weight.transpose(), &key)?)?;
        if let Some(bias) = &self.bias {
            bias.export_weights(&join_key(prefix, "bias"), out)?;
        }
        Ok(())
    }

    fn import_weights(mut self, prefix: &str, loader: &mut WeightLoader) -> Self {
        let dims = self.weight.val().dims();
        if let Some(values) = loader.take(&join_key(prefix, "weight"), &dims, Layout::Transposed) {
            self.weight = replace_param(self.weight, values);
        }
        self.bias = self.bias.map(|bias| bias.import_weights(&join_key(prefix, "bias"), loader));
        self
    }
}

impl<B: Backend> NamedWeights<B> for LayerNorm<B> {
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()> {
        self.gamma.export_weights(&join_key(prefix, "weight"), out)?;
        self.beta.export_weights(&join_key(prefix, "bias"), out)
    }

    fn import_weights(mut self, prefix: &str, loader: &mut WeightLoader) -> Self {
        self.gamma = self.gamma.import_weights(&join_key(prefix, "weight"), loader);
        self.beta = self.beta.import_weights(&join_key(prefix, "bias"), loader);
        self
    }
}

impl<B: Backend, T: NamedWeights<B>> NamedWeights<B> for Option<T> {
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()> {
        match self {
            Some(inner) => inner.export_weights(prefix, out),
            None => Ok(()),
        }
    }

    fn import_weights(self, prefix: &str, loader: &mut WeightLoader) -> Self {
        self.map(|inner| inner.import_weights(prefix, loader))
    }
}

impl<B: Backend, T: NamedWeights<B>> NamedWeights<B> for Vec<T> {
    fn export_weights(&self, prefix: &str, out: &mut StateDict) -> Result<()> {
        for (index, item) in self.iter().enumerate() {
            item.export_weights(&join_key(prefix, &index.to_string()), out)?;
        }
        Ok(())
    }

    fn import_weights(self, prefix: &str, loader: &mut WeightLoader) -> Self {
        self.into_iter()
            .enumerate()
            .map(|(index, item)| item.import_weights(&join_key(prefix, &index.to_string()), loader))
            .collect()
    }
}

/// Implement [`NamedWeights`] for a module struct by delegating to the listed
/// fields, each stored under its own field name.
macro_rules! impl_named_weights {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl<B: burn::tensor::backend::Backend> $crate::weights::NamedWeights<B> for $ty<B> {
            fn export_weights(
                &self,
                prefix: &str,
                out: &mut $crate::weights::StateDict,
            ) -> action_core::Result<()> {
                $(
                    $crate::weights::NamedWeights::<B>::export_weights(
                        &self.$field,
                        &$crate::weights::join_key(prefix, stringify!($field)),
                        out,
                    )?;
                )+
                Ok(())
            }

            fn import_weights(mut self, prefix: &str, loader: &mut $crate::weights::WeightLoader) -> Self {
                $(
                    self.$field = $crate::weights::NamedWeights::<B>::import_weights(
                        self.$field,
                        &$crate::weights::join_key(prefix, stringify!($field)),
                        loader,
                    );
                )+
                self
            }
        }
    };
}

pub(crate) use impl_named_weights;

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{LayerNormConfig, LinearConfig};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_safetensors_roundtrip_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut dict = StateDict::new();
        dict.insert("teacher.backbone.norm.weight", vec![2], vec![1.0, 2.0]).unwrap();
        dict.insert("teacher.head.weight", vec![1, 2], vec![3.0, 4.0]).unwrap();
        dict.save_safetensors(&path).unwrap();

        let loaded = StateDict::from_safetensors_file(&path).unwrap();
        assert_eq!(loaded, dict);
    }

    #[test]
    fn test_safetensors_header_carries_format() {
        let mut dict = StateDict::new();
        dict.insert("head.bias", vec![3], vec![0.0, 1.0, 2.0]).unwrap();
        let bytes = dict.to_safetensors_bytes().unwrap();

        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let metadata = header.metadata().as_ref().unwrap();
        assert_eq!(metadata.get("format").map(String::as_str), Some("pt"));
        assert_eq!(StateDict::from_safetensors_bytes(&bytes).unwrap(), dict);
    }

    #[test]
    fn test_insert_checks_shape() {
        let mut dict = StateDict::new();
        assert!(dict.insert("x", vec![2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_select_entry_and_strip_prefix() {
        let mut dict = StateDict::new();
        dict.insert("teacher.backbone.cls_token", vec![1], vec![0.5]).unwrap();
        dict.insert("teacher.head.mlp.weight", vec![1], vec![0.1]).unwrap();
        dict.insert("student.backbone.cls_token", vec![1], vec![0.9]).unwrap();

        let backbone = dict.select_entry("teacher").strip_prefix("backbone.");
        assert_eq!(backbone.keys().collect::<Vec<_>>(), vec!["cls_token"]);
        assert_eq!(backbone.get("cls_token").unwrap().values, vec![0.5]);
    }

    #[test]
    fn test_select_missing_entry_is_identity() {
        let mut dict = StateDict::new();
        dict.insert("backbone.pos_embed", vec![1], vec![0.5]).unwrap();
        let selected = dict.clone().select_entry("teacher");
        assert_eq!(selected, dict);
    }

    #[test]
    fn test_linear_export_import_transposes() {
        let device = Default::default();
        let linear = LinearConfig::new(3, 2).init::<TestBackend>(&device);

        let mut dict = StateDict::new();
        // PyTorch layout [out=2, in=3]
        dict.insert("fc.weight", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        dict.insert("fc.bias", vec![2], vec![0.5, -0.5]).unwrap();

        let mut loader = WeightLoader::new(dict.clone());
        let linear = linear.import_weights("fc", &mut loader);
        let report = loader.finish();
        assert!(report.is_exact());
        assert_eq!(report.loaded.len(), 2);

        let weight = linear.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(weight, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let mut exported = StateDict::new();
        linear.export_weights("fc", &mut exported).unwrap();
        assert_eq!(exported, dict);
    }

    #[test]
    fn test_conv_kernel_flattened_into_linear() {
        let device = Default::default();
        let linear = LinearConfig::new(4, 1).init::<TestBackend>(&device);

        let mut dict = StateDict::new();
        dict.insert("proj.weight", vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut loader = WeightLoader::new(dict);
        let linear = linear.import_weights("proj", &mut loader);
        let report = loader.finish();

        assert_eq!(report.loaded, vec!["proj.weight".to_string()]);
        assert_eq!(report.missing, vec!["proj.bias".to_string()]);
        assert_eq!(linear.weight.val().into_data().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_mismatch_and_unexpected_reported() {
        let device = Default::default();
        let norm = LayerNormConfig::new(4).init::<TestBackend>(&device);

        let mut dict = StateDict::new();
        dict.insert("norm.weight", vec![3], vec![0.0; 3]).unwrap();
        dict.insert("norm.bias", vec![4], vec![1.0; 4]).unwrap();
        dict.insert("extra", vec![1], vec![0.0]).unwrap();

        let mut loader = WeightLoader::new(dict);
        let norm = norm.import_weights("norm", &mut loader);
        let report = loader.finish();

        assert_eq!(report.loaded, vec!["norm.bias".to_string()]);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.unexpected, vec!["extra".to_string()]);
        // mismatched gamma keeps its initial ones
        assert_eq!(norm.gamma.val().into_data().to_vec::<f32>().unwrap(), vec![1.0; 4]);
        assert_eq!(norm.beta.val().into_data().to_vec::<f32>().unwrap(), vec![1.0; 4]);
    }
}
