//! Error types for the training engine
//!
//! Kernels report what went wrong with a [`KernelError`]; layers and the optimizer
//! wrap it into an [`EngineError::LayerCompute`] tagged with the phase that failed,
//! so the driver can report "backward failed in max_pool" before stopping the run.

use std::fmt;
use thiserror::Error;

use crate::engine::TrainingState;
use crate::tensor::Shape;

/// Phase of a training step. Used to report where a fatal failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Backward,
    Loss,
    Optimizer,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Forward => "forward",
            Phase::Backward => "backward",
            Phase::Loss => "loss",
            Phase::Optimizer => "optimizer",
        };
        f.write_str(name)
    }
}

/// Errors raised by the compute kernels when they reject their operands.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("shape mismatch for {tensor}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch size mismatch: expected at most {expected}, got {actual}")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("backward called without a matching training-mode forward pass")]
    MissingForwardState,

    #[error("non-finite value produced in {tensor}")]
    NonFiniteValue { tensor: &'static str },
}

impl KernelError {
    /// Tag this kernel failure with the phase and layer it happened in.
    pub fn during(self, phase: Phase, layer: &'static str) -> EngineError {
        EngineError::LayerCompute {
            phase,
            layer,
            source: self,
        }
    }
}

/// Errors that can occur while building or running the training engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to allocate tensor {shape} x {batch_size}: {reason}")]
    AllocationFailure {
        shape: Shape,
        batch_size: usize,
        reason: String,
    },

    #[error("{phase} failed in {layer}: {source}")]
    LayerCompute {
        phase: Phase,
        layer: &'static str,
        #[source]
        source: KernelError,
    },

    #[error("training already finished: {state}")]
    TrainingFinished { state: TrainingState },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// The phase a compute failure happened in, if this is one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            EngineError::LayerCompute { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_compute_message_names_phase_and_layer() {
        let err = KernelError::ShapeMismatch {
            tensor: "input",
            expected: 400,
            actual: 399,
        }
        .during(Phase::Backward, "max_pool");

        assert_eq!(err.phase(), Some(Phase::Backward));
        let message = err.to_string();
        assert!(message.starts_with("backward failed in max_pool"));
        assert!(message.contains("expected 400"));
    }

    #[test]
    fn test_non_compute_errors_have_no_phase() {
        let err = EngineError::InvalidConfig("batch_size must be positive".into());
        assert_eq!(err.phase(), None);
    }
}
