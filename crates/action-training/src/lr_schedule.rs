//! Learning rate scheduling.
//!
//! Fine-tuning uses a multi-step decay: the rate is multiplied by `gamma`
//! each time the epoch counter passes a milestone.

use serde::{Deserialize, Serialize};

use action_core::{Error, Result, SolverConfig};

/// Multi-step learning rate decay, stepped once per epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    /// Number of completed `step` calls
    last_epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Result<Self> {
        if milestones.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::Config(format!(
                "milestones must be strictly increasing, got {milestones:?}"
            )));
        }
        Ok(Self {
            base_lr,
            milestones,
            gamma,
            last_epoch: 0,
        })
    }

    pub fn from_solver(base_lr: f64, solver: &SolverConfig) -> Result<Self> {
        Self::new(base_lr, solver.milestones.clone(), solver.gamma)
    }

    /// Rate for the current epoch
    pub fn lr(&self) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= self.last_epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    /// Advance one epoch (call after the epoch's optimizer steps)
    pub fn step(&mut self) {
        self.last_epoch += 1;
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    /// Fast-forward to `epoch` completed steps
    pub fn set_epoch(&mut self, epoch: usize) {
        self.last_epoch = epoch;
    }
}
