//! Single-view validation.
//!
//! Runs the inference model over one centre clip per video and reports
//! cross-entropy loss and top-1 accuracy, both averaged over samples.

use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{backend::Backend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use action_core::metrics::argmax;
use action_core::{Collective, Error, ForwardMode, MetricLogger, Result};
use action_dataset::VideoBatch;

use crate::model::ClipClassifier;

/// Sample-weighted validation averages; accuracy in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub loss: f64,
    pub acc1: f64,
    pub samples: usize,
}

/// Top-1 correct predictions among the rows of `logits` (`[n, classes]`
/// flattened row-major)
pub fn count_top1_correct(logits: &[f32], num_classes: usize, labels: &[usize]) -> usize {
    logits
        .chunks(num_classes.max(1))
        .zip(labels)
        .filter(|(row, &label)| argmax(row) == label)
        .count()
}

pub fn validate<B, M, I>(model: &M, batches: I, collective: &dyn Collective) -> Result<ValidationStats>
where
    B: Backend,
    M: ClipClassifier<B>,
    I: IntoIterator<Item = VideoBatch<B>>,
{
    let mut logger = MetricLogger::new("  ");

    for batch in batches {
        let batch_size = batch.len();
        if batch_size == 0 {
            continue;
        }
        let logits = model.classify(batch.clips, ForwardMode::Eval);
        let [_, num_classes] = logits.dims();

        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.targets)
            .into_scalar()
            .elem::<f64>();

        let values = logits
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Model(format!("Failed to read logits: {:?}", e)))?;
        let correct = count_top1_correct(&values, num_classes, &batch.labels);

        logger.update("loss", loss, batch_size);
        logger.update("acc1", 100.0 * correct as f64 / batch_size as f64, batch_size);
    }

    logger.synchronize_between_processes(collective)?;

    let loss = logger.meter("loss").map(|m| m.global_avg()).unwrap_or(0.0);
    let acc1 = logger.meter("acc1").map(|m| m.global_avg()).unwrap_or(0.0);
    let samples = logger.meter("acc1").map(|m| m.count()).unwrap_or(0);

    info!("* Acc@1 {acc1:.3} loss {loss:.3} ({samples} samples)");
    Ok(ValidationStats { loss, acc1, samples })
}
