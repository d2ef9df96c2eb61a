//! Running statistics and accuracy helpers.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::distributed::Collective;
use crate::Result;

/// Tracks a series of values, exposing smoothed values over a window and the
/// global series average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    /// Record `value` observed `n` times (e.g. a batch mean over `n` samples).
    pub fn update(&mut self, value: f64, n: usize) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n;
        self.total += value * n as f64;
    }

    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        // lower median, matching an even-length torch median
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Most recent value
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Sum `count` and `total` across ranks. The window stays rank-local.
    pub fn synchronize(&mut self, collective: &dyn Collective) -> Result<()> {
        let mut buffer = [self.count as f64, self.total];
        collective.all_reduce_sum(&mut buffer)?;
        self.count = buffer[0].round() as usize;
        self.total = buffer[1];
        Ok(())
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
    }
}

/// Named collection of [`SmoothedValue`] meters.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    window_size: usize,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: BTreeMap::new(),
            window_size: 20,
            delimiter: delimiter.into(),
        }
    }

    /// Register a meter with a custom window before it is first updated.
    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        self.meters.insert(name.into(), meter);
    }

    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        let window_size = self.window_size;
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(window_size))
            .update(value, n);
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn synchronize_between_processes(&mut self, collective: &dyn Collective) -> Result<()> {
        // BTreeMap order keeps the reduction sequence identical on every rank
        for meter in self.meters.values_mut() {
            meter.synchronize(collective)?;
        }
        Ok(())
    }

    /// Global average of every meter, keyed by meter name.
    pub fn global_averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }

    /// Whether iteration `iter` out of `total` should be logged.
    pub fn should_log(iter: usize, total: usize, print_freq: usize) -> bool {
        print_freq > 0 && (iter % print_freq == 0 || iter + 1 == total)
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{name}: {meter}"))
            .collect();
        f.write_str(&parts.join(&self.delimiter))
    }
}

/// Indices of the `k` largest entries, highest first. Ties keep the lower index first.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

pub fn argmax(scores: &[f32]) -> usize {
    top_k_indices(scores, 1).first().copied().unwrap_or(0)
}

/// Whether `label` is among the `k` highest scores.
pub fn is_top_k_correct(scores: &[f32], label: usize, k: usize) -> bool {
    top_k_indices(scores, k).contains(&label)
}

/// Numerically stable softmax of one row.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
