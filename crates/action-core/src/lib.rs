//! Core types and utilities for fine-tuning video action-recognition models.
//!
//! This crate provides the error type, shared enums, the run configuration,
//! running-statistics meters and the distributed bookkeeping used across the
//! workspace.

pub mod cli;
pub mod config;
pub mod distributed;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::{DataConfig, ModelConfig, RunConfig, SolverConfig, TestConfig};
pub use distributed::{Collective, DistributedContext, LocalCollective, RendezvousCollective, Role};
pub use error::{Error, Result};
pub use metrics::{MetricLogger, SmoothedValue};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::distributed::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
