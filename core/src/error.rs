//! Errors raised by the distributed core.
//!
//! None of these are recoverable at the point of detection: a step that fails on one client
//! leaves the others waiting inside a collective or holding divergent state, so callers are
//! expected to propagate them to process exit.

use crate::tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// Mesh size or device count mismatch.
    #[error("Topology error: {0}")]
    Topology(String),

    /// Clients disagree about something they must agree on.
    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Layout error: {0}")]
    Layout(String),

    #[error("Global batch of {batch} rows is not divisible by {replicas} batch replicas")]
    BatchNotDivisible { batch: usize, replicas: usize },

    /// Restoring into an incompatible mesh or parameter set.
    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    /// The transport failed, usually because a peer client exited.
    #[error("Collective operation failed: {0}")]
    Collective(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unsupported storage location: {0}")]
    UnsupportedStorage(String),

    #[error("Input pipeline ran dry after {steps} steps")]
    InputExhausted { steps: usize },

    #[error("No mesh in scope; wrap the call in `run_on`")]
    NoMeshInScope,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid layout rule: {0}")]
    Regex(#[from] regex::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = MeshError::BatchNotDivisible {
            batch: 30,
            replicas: 4,
        };
        assert_eq!(
            err.to_string(),
            "Global batch of 30 rows is not divisible by 4 batch replicas"
        );
    }

    #[test]
    fn test_tensor_error_is_transparent() {
        let err: MeshError = TensorError::Unsupported("rank 0".into()).into();
        assert_eq!(err.to_string(), "Unsupported operation: rank 0");
    }
}
