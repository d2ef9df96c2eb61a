//! Multi-view test aggregation.
//!
//! Every validation video is seen as `views x crops` clips. Their predictions
//! are combined per video (sum of logits, mean of probabilities or max of
//! logits) and the video is scored once all of its views have arrived.

use std::time::{Duration, Instant};

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use action_core::metrics::{is_top_k_correct, softmax};
use action_core::{EnsembleMethod, Error, ForwardMode, IncompletePolicy, Result, SmoothedValue};
use action_dataset::VideoBatch;

use crate::model::ClipClassifier;

/// Final multi-view accuracy; percentages over the counted videos
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiViewStats {
    pub top1: f64,
    /// Only reported with at least five classes
    pub top5: Option<f64>,
    /// Videos included in the accuracy
    pub num_videos: usize,
    /// Videos with some but not all views
    pub num_incomplete: usize,
    /// Videos that received no view at all
    pub num_missing: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Verdict {
    top1: bool,
    top5: bool,
}

/// Per-video accumulation of view predictions
#[derive(Debug)]
pub struct MultiViewMeter {
    num_videos: usize,
    views_per_video: usize,
    num_classes: usize,
    method: EnsembleMethod,
    policy: IncompletePolicy,
    /// `[num_videos * num_classes]`
    video_preds: Vec<f32>,
    video_labels: Vec<Option<usize>>,
    view_counts: Vec<usize>,
    verdicts: Vec<Option<Verdict>>,
    log_period: usize,
    iter_timer: SmoothedValue,
    data_timer: SmoothedValue,
    iter_start: Instant,
    data_ready: Duration,
}

impl MultiViewMeter {
    pub fn new(
        num_videos: usize,
        views_per_video: usize,
        num_classes: usize,
        method: EnsembleMethod,
        policy: IncompletePolicy,
    ) -> Self {
        let fill = match method {
            EnsembleMethod::Max => f32::NEG_INFINITY,
            EnsembleMethod::Sum | EnsembleMethod::Mean => 0.0,
        };
        Self {
            num_videos,
            views_per_video,
            num_classes,
            method,
            policy,
            video_preds: vec![fill; num_videos * num_classes],
            video_labels: vec![None; num_videos],
            view_counts: vec![0; num_videos],
            verdicts: vec![None; num_videos],
            log_period: 10,
            iter_timer: SmoothedValue::default(),
            data_timer: SmoothedValue::default(),
            iter_start: Instant::now(),
            data_ready: Duration::ZERO,
        }
    }

    pub fn with_log_period(mut self, log_period: usize) -> Self {
        self.log_period = log_period.max(1);
        self
    }

    pub fn num_videos(&self) -> usize {
        self.num_videos
    }

    pub fn view_count(&self, video: usize) -> usize {
        self.view_counts.get(video).copied().unwrap_or(0)
    }

    /// Combined scores of `video` (`num_classes` values)
    pub fn video_scores(&self, video: usize) -> Option<Vec<f32>> {
        let count = *self.view_counts.get(video)?;
        if count == 0 {
            return None;
        }
        let row = &self.video_preds[video * self.num_classes..(video + 1) * self.num_classes];
        Some(match self.method {
            EnsembleMethod::Mean => row.iter().map(|v| v / count as f32).collect(),
            EnsembleMethod::Sum | EnsembleMethod::Max => row.to_vec(),
        })
    }

    /// Accumulate one batch. `logits` holds one `num_classes` row per clip.
    pub fn update(&mut self, logits: &[f32], labels: &[usize], sample_indices: &[usize]) -> Result<()> {
        if logits.len() != labels.len() * self.num_classes || labels.len() != sample_indices.len() {
            return Err(Error::InvalidArgument(format!(
                "{} logits for {} labels and {} sample indices with {} classes",
                logits.len(),
                labels.len(),
                sample_indices.len(),
                self.num_classes
            )));
        }

        for ((row, &label), &video) in logits.chunks(self.num_classes).zip(labels).zip(sample_indices) {
            if video >= self.num_videos {
                return Err(Error::Dataset(format!(
                    "sample index {video} out of range for {} videos",
                    self.num_videos
                )));
            }
            match self.video_labels[video] {
                Some(stored) if stored != label => {
                    return Err(Error::Dataset(format!(
                        "video {video} has conflicting labels {stored} and {label}"
                    )));
                }
                _ => self.video_labels[video] = Some(label),
            }
            if self.view_counts[video] >= self.views_per_video {
                warn!(
                    "Video {video} already has {} views, ignoring extra view",
                    self.views_per_video
                );
                continue;
            }

            let acc = &mut self.video_preds[video * self.num_classes..(video + 1) * self.num_classes];
            match self.method {
                EnsembleMethod::Sum => acc.iter_mut().zip(row).for_each(|(a, v)| *a += v),
                EnsembleMethod::Mean => acc.iter_mut().zip(softmax(row)).for_each(|(a, p)| *a += p),
                EnsembleMethod::Max => acc.iter_mut().zip(row).for_each(|(a, v)| *a = a.max(*v)),
            }
            self.view_counts[video] += 1;

            if self.view_counts[video] == self.views_per_video {
                self.verdicts[video] = self.judge(video, label);
            }
        }
        Ok(())
    }

    fn judge(&self, video: usize, label: usize) -> Option<Verdict> {
        let scores = self.video_scores(video)?;
        Some(Verdict {
            top1: is_top_k_correct(&scores, label, 1),
            top5: is_top_k_correct(&scores, label, 5),
        })
    }

    /// Score every video and report accuracy over those the policy counts.
    pub fn finalize(&self) -> Result<MultiViewStats> {
        let mut counted = 0usize;
        let mut top1 = 0usize;
        let mut top5 = 0usize;
        let mut num_incomplete = 0usize;
        let mut num_missing = 0usize;

        for video in 0..self.num_videos {
            let count = self.view_counts[video];
            let verdict = if count == 0 {
                num_missing += 1;
                None
            } else if count < self.views_per_video {
                num_incomplete += 1;
                match self.policy {
                    IncompletePolicy::Drop => None,
                    IncompletePolicy::Partial => self.video_labels[video].and_then(|label| self.judge(video, label)),
                }
            } else {
                self.verdicts[video]
            };

            if let Some(verdict) = verdict {
                counted += 1;
                top1 += usize::from(verdict.top1);
                top5 += usize::from(verdict.top5);
            }
        }

        if num_incomplete + num_missing > 0 {
            warn!(
                "{} of {} videos incomplete ({} with no views, {:.1}% complete); policy: {}",
                num_incomplete + num_missing,
                self.num_videos,
                num_missing,
                self.complete_ratio() * 100.0,
                self.policy
            );
        }
        if counted == 0 {
            return Err(Error::Dataset("no video received enough views to be scored".into()));
        }

        let percent = |hits: usize| 100.0 * hits as f64 / counted as f64;
        Ok(MultiViewStats {
            top1: percent(top1),
            top5: (self.num_classes >= 5).then(|| percent(top5)),
            num_videos: counted,
            num_incomplete,
            num_missing,
        })
    }

    fn complete_ratio(&self) -> f64 {
        if self.num_videos == 0 {
            return 1.0;
        }
        let complete = self.view_counts.iter().filter(|&&c| c >= self.views_per_video).count();
        complete as f64 / self.num_videos as f64
    }

    /// Start timing an iteration
    pub fn iter_tic(&mut self) {
        self.iter_start = Instant::now();
    }

    /// The batch for this iteration is ready
    pub fn data_toc(&mut self) {
        self.data_ready = self.iter_start.elapsed();
    }

    /// The iteration finished
    pub fn iter_toc(&mut self) {
        self.data_timer.update(self.data_ready.as_secs_f64(), 1);
        self.iter_timer.update(self.iter_start.elapsed().as_secs_f64(), 1);
    }

    pub fn log_iter_stats(&self, cur_iter: usize) {
        if (cur_iter + 1) % self.log_period != 0 {
            return;
        }
        info!(
            "test_iter {}  time_diff {:.4}s  data {:.4}s  videos complete {:.1}%",
            cur_iter + 1,
            self.iter_timer.value(),
            self.data_timer.value(),
            self.complete_ratio() * 100.0
        );
    }
}

/// Run every multi-view batch through `model` and feed `meter`.
///
/// `on_batch` is called with the number of batches processed so far.
pub fn test_multi_view<B, M, I>(
    model: &M,
    batches: I,
    meter: &mut MultiViewMeter,
    mut on_batch: impl FnMut(usize),
) -> Result<MultiViewStats>
where
    B: Backend,
    M: ClipClassifier<B>,
    I: IntoIterator<Item = VideoBatch<B>>,
{
    let mut batches = batches.into_iter();
    let mut cur_iter = 0;

    loop {
        meter.iter_tic();
        let Some(batch) = batches.next() else {
            break;
        };
        meter.data_toc();

        if !batch.is_empty() {
            let logits = model
                .classify(batch.clips, ForwardMode::Eval)
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| Error::Model(format!("Failed to read logits: {:?}", e)))?;
            meter.update(&logits, &batch.labels, &batch.sample_indices)?;
        }

        meter.iter_toc();
        meter.log_iter_stats(cur_iter);
        cur_iter += 1;
        on_batch(cur_iter);
    }

    let stats = meter.finalize()?;
    match stats.top5 {
        Some(top5) => info!("* Multi-view Acc@1 {:.3} Acc@5 {:.3} over {} videos", stats.top1, top5, stats.num_videos),
        None => info!("* Multi-view Acc@1 {:.3} over {} videos", stats.top1, stats.num_videos),
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(method: EnsembleMethod, policy: IncompletePolicy) -> MultiViewMeter {
        MultiViewMeter::new(3, 2, 3, method, policy)
    }

    #[test]
    fn test_mean_ensembling_beats_per_clip_accuracy() {
        let mut meter = meter(EnsembleMethod::Mean, IncompletePolicy::Drop);
        // each video has one narrowly wrong view and one confidently right view
        let logits = [
            1.0, 1.2, 0.0, // video 0 (label 0): wrong
            0.5, 0.4, 0.0, // video 1 (label 1): wrong
            0.0, 0.0, 4.0, // video 2 (label 2): right
            3.0, 0.0, 0.0, // video 0: right
            0.0, 2.5, 0.0, // video 1: right
            0.0, 0.3, 0.1, // video 2: wrong
        ];
        meter.update(&logits[..9], &[0, 1, 2], &[0, 1, 2]).unwrap();
        meter.update(&logits[9..], &[0, 1, 2], &[0, 1, 2]).unwrap();

        let stats = meter.finalize().unwrap();
        assert_eq!(stats.num_videos, 3);
        assert!((stats.top1 - 100.0).abs() < 1e-9);
        assert_eq!(stats.top5, None);

        let scores = meter.video_scores(2).unwrap();
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_mean_recovers_when_every_view_is_wrong() {
        let mut meter = meter(EnsembleMethod::Mean, IncompletePolicy::Drop);
        // both views of each video narrowly prefer a different wrong class
        let first_views = [
            2.0, 2.1, -5.0, // video 0 (label 0)
            2.1, 2.0, -5.0, // video 1 (label 1)
            2.1, -5.0, 2.0, // video 2 (label 2)
        ];
        let second_views = [
            2.0, -5.0, 2.1, //
            -5.0, 2.0, 2.1, //
            -5.0, 2.1, 2.0,
        ];
        let labels = [0, 1, 2];
        for views in [&first_views, &second_views] {
            assert_eq!(count_correct(views, &labels), 0);
            meter.update(views, &labels, &[0, 1, 2]).unwrap();
        }

        let stats = meter.finalize().unwrap();
        assert_eq!(stats.num_videos, 3);
        assert!((stats.top1 - 100.0).abs() < 1e-9);

        let scores = meter.video_scores(0).unwrap();
        assert!(scores[0] > scores[1] && scores[0] > scores[2]);
    }

    fn count_correct(logits: &[f32], labels: &[usize]) -> usize {
        logits
            .chunks(3)
            .zip(labels)
            .filter(|(row, &label)| action_core::metrics::argmax(row) == label)
            .count()
    }

    #[test]
    fn test_sum_flips_wrong_majority() {
        let mut meter = MultiViewMeter::new(1, 3, 2, EnsembleMethod::Sum, IncompletePolicy::Drop);
        meter
            .update(&[0.0, 0.1, 0.0, 0.1, 2.0, 0.0], &[0, 0, 0], &[0, 0, 0])
            .unwrap();
        assert!((meter.finalize().unwrap().top1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_ensembling() {
        let mut meter = MultiViewMeter::new(1, 2, 2, EnsembleMethod::Max, IncompletePolicy::Drop);
        meter.update(&[-1.0, -3.0, -2.0, 0.5], &[1, 1], &[0, 0]).unwrap();
        assert_eq!(meter.video_scores(0).unwrap(), vec![-1.0, 0.5]);
        assert!((meter.finalize().unwrap().top1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_incomplete_policies() {
        let logits = [0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0];
        for (policy, expected_videos, expected_top1) in [
            (IncompletePolicy::Drop, 2, 50.0),
            (IncompletePolicy::Partial, 3, 100.0 / 3.0),
        ] {
            let mut meter = meter(EnsembleMethod::Sum, policy);
            // videos 0 and 1 get both views; video 2 only one
            meter.update(&logits, &[1, 0, 1], &[0, 1, 2]).unwrap();
            meter.update(&logits[..6], &[1, 0], &[0, 1]).unwrap();

            let stats = meter.finalize().unwrap();
            assert_eq!(stats.num_videos, expected_videos, "{policy}");
            assert_eq!(stats.num_incomplete, 1);
            assert!((stats.top1 - expected_top1).abs() < 1e-9, "{policy}: {}", stats.top1);
        }
    }

    #[test]
    fn test_label_conflict_is_error() {
        let mut meter = meter(EnsembleMethod::Sum, IncompletePolicy::Drop);
        meter.update(&[1.0, 0.0, 0.0], &[0], &[1]).unwrap();
        let err = meter.update(&[1.0, 0.0, 0.0], &[2], &[1]).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_extra_views_ignored() {
        let mut meter = MultiViewMeter::new(1, 1, 2, EnsembleMethod::Sum, IncompletePolicy::Drop);
        meter.update(&[0.0, 1.0], &[1], &[0]).unwrap();
        meter.update(&[5.0, 0.0], &[1], &[0]).unwrap();
        assert_eq!(meter.view_count(0), 1);
        assert!((meter.finalize().unwrap().top1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_top5_with_many_classes() {
        let mut meter = MultiViewMeter::new(1, 1, 6, EnsembleMethod::Sum, IncompletePolicy::Drop);
        meter.update(&[6.0, 5.0, 4.0, 3.0, 2.0, 1.0], &[3], &[0]).unwrap();
        let stats = meter.finalize().unwrap();
        assert_eq!(stats.top1, 0.0);
        assert_eq!(stats.top5, Some(100.0));
    }

    #[test]
    fn test_no_views_is_error() {
        let meter = meter(EnsembleMethod::Sum, IncompletePolicy::Partial);
        assert!(meter.finalize().is_err());
    }
}
