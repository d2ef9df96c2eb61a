//! Compute backend of the `finetune` binary.
//!
//! Library code is generic over `B: AutodiffBackend`; only the binary picks a
//! concrete backend. The `cuda` feature switches from CPU NdArray to CUDA.

use burn::backend::Autodiff;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn_ndarray::NdArray;

/// Backend the training loop differentiates through
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Name shown in the run summary
pub fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA (GPU)"
    } else {
        "NdArray (CPU)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_cpu_backend_name() {
        assert_eq!(backend_name(), "NdArray (CPU)");
    }
}
