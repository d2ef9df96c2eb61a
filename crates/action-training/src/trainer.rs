//! Training loop.
//!
//! One call to [`train_one_epoch`] runs every batch of an epoch through
//! forward, cross-entropy, backward and an SGD step at a fixed rate. The
//! caller steps the scheduler afterwards.

use std::collections::BTreeMap;

use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::info;

use action_core::{Collective, Error, ForwardMode, MetricLogger, Result, SmoothedValue};
use action_dataset::VideoBatch;

use crate::model::ClipClassifier;

/// Iterations between running-stat log lines
pub const LOG_FREQ: usize = 20;

/// Epoch averages, keyed by meter name (`loss`, `lr`)
pub type EpochStats = BTreeMap<String, f64>;

/// Train `model` for one epoch over `batches`.
///
/// `num_batches` is only used for progress logging. Stats are reduced across
/// ranks through `collective` before the epoch averages are returned.
pub fn train_one_epoch<B, M, O, I>(
    mut model: M,
    optimizer: &mut O,
    batches: I,
    num_batches: usize,
    epoch: usize,
    lr: f64,
    collective: &dyn Collective,
) -> Result<(M, EpochStats)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ClipClassifier<B>,
    O: Optimizer<M, B>,
    I: IntoIterator<Item = VideoBatch<B>>,
{
    let mut logger = MetricLogger::new("  ");
    logger.add_meter("lr", SmoothedValue::new(1));
    let header = format!("Epoch: [{epoch}]");

    for (iter, batch) in batches.into_iter().enumerate() {
        if batch.is_empty() {
            continue;
        }
        let logits = model.classify(batch.clips, ForwardMode::Train);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, batch.targets);

        let loss_value = loss.clone().into_scalar().elem::<f64>();
        if !loss_value.is_finite() {
            return Err(Error::Other(format!(
                "Loss is {loss_value} at epoch {epoch}, iteration {iter}; stopping training"
            )));
        }

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(lr, model, grads);

        logger.update("loss", loss_value, 1);
        logger.update("lr", lr, 1);
        if MetricLogger::should_log(iter, num_batches, LOG_FREQ) {
            info!("{header} [{iter}/{num_batches}]  {logger}");
        }
    }

    logger.synchronize_between_processes(collective)?;
    info!("{header} averaged stats: {logger}");
    Ok((model, logger.global_averages()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackboneConfig, VideoClassifier};
    use crate::optim::build_optimizer;
    use action_core::{Architecture, LocalCollective, RunConfig};
    use action_dataset::ClipMeta;
    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, Int, Tensor, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_model() -> VideoClassifier<TestBackend> {
        let mut config = RunConfig::default();
        config.data.train_crop_size = 16;
        config.data.test_crop_size = 16;
        config.data.num_frames = 2;
        config.model.depth = Some(1);
        config.model.embed_dim = Some(8);
        config.model.num_heads = Some(2);
        config.model.num_classes = 3;
        let backbone = BackboneConfig::for_architecture(Architecture::VitTiny, &config, 8).unwrap();
        VideoClassifier::new(&backbone, &Default::default())
    }

    fn batch(labels: &[usize]) -> VideoBatch<TestBackend> {
        let device = Default::default();
        let n = labels.len();
        VideoBatch {
            clips: Tensor::random([n, 3, 2, 16, 16], Distribution::Default, &device),
            targets: Tensor::<TestBackend, 1, Int>::from_data(
                TensorData::new(labels.iter().map(|&l| l as i64).collect::<Vec<_>>(), [n]),
                &device,
            ),
            labels: labels.to_vec(),
            sample_indices: (0..n).collect(),
            metas: vec![ClipMeta::default(); n],
        }
    }

    #[test]
    fn test_epoch_updates_parameters_and_reports_stats() {
        let model = tiny_model();
        let before = model.state_dict().unwrap();
        let mut optimizer = build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&Default::default());

        let batches = vec![batch(&[0, 1]), batch(&[2, 0])];
        let (model, stats) =
            train_one_epoch(model, &mut optimizer, batches, 2, 0, 0.01, &LocalCollective).unwrap();

        assert_ne!(model.state_dict().unwrap(), before);
        assert!(stats["loss"].is_finite());
        assert!((stats["lr"] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_empty_batches_are_skipped() {
        let model = tiny_model();
        let mut optimizer = build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&Default::default());

        // every clip of the first batch failed to decode
        let batches = vec![batch(&[]), batch(&[1, 2])];
        let (_, stats) = train_one_epoch(model, &mut optimizer, batches, 2, 0, 0.01, &LocalCollective).unwrap();
        assert!(stats["loss"].is_finite());
    }

    #[test]
    fn test_zero_rate_keeps_parameters() {
        let model = tiny_model();
        let before = model.state_dict().unwrap();
        let mut optimizer = build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&Default::default());

        // weight decay and momentum are both scaled by the rate
        let (model, _) =
            train_one_epoch(model, &mut optimizer, vec![batch(&[1])], 1, 0, 0.0, &LocalCollective).unwrap();
        assert_eq!(model.state_dict().unwrap(), before);
    }
}
