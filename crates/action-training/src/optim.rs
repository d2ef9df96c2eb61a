//! Optimizer construction.

use burn::{
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, Optimizer, SgdConfig},
    tensor::backend::AutodiffBackend,
};
use tracing::info;

use action_core::SolverConfig;

/// Linear scaling rule: `base_lr * batch_per_device * world_size / reference`
pub fn scaled_learning_rate(
    base_lr: f64,
    batch_per_device: usize,
    world_size: usize,
    reference_batch_size: usize,
) -> f64 {
    base_lr * (batch_per_device * world_size) as f64 / reference_batch_size.max(1) as f64
}

pub fn sgd_config(solver: &SolverConfig) -> SgdConfig {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(solver.momentum)
                .with_dampening(solver.dampening),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(solver.weight_decay as f32)))
}

/// SGD with momentum and weight decay over every parameter of `M`
pub fn build_optimizer<B, M>(solver: &SolverConfig) -> impl Optimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    info!(
        "SGD: momentum {}, dampening {}, weight decay {}",
        solver.momentum, solver.dampening, solver.weight_decay
    );
    sgd_config(solver).init()
}
