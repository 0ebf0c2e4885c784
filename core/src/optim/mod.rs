//! Optimizers.
//!
//! An optimizer updates one flat parameter shard at a time from the matching block of the
//! gradient. State is keyed by an integer the caller keeps stable across steps, so every shard
//! of every parameter has its own moments.

pub mod adamw;
pub mod sgd;

pub use adamw::AdamW;
pub use sgd::Sgd;

use crate::tensor::{Result, TensorError};
use serde::{Deserialize, Serialize};

pub trait Optimizer: Send {
    /// Applies one update to `param` in place.
    fn update(&mut self, key: usize, param: &mut [f32], grad: &[f32]) -> Result<()>;

    fn learning_rate(&self) -> f32;
}

/// Optimizer selection for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Adam,
    AdamW,
    Sgd,
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f32) -> Box<dyn Optimizer> {
        match self {
            Self::Adam => Box::new(AdamW::adam(learning_rate)),
            Self::AdamW => Box::new(AdamW::new(learning_rate)),
            Self::Sgd => Box::new(Sgd::new(learning_rate)),
        }
    }
}

fn check_lengths(param: &[f32], grad: &[f32]) -> Result<()> {
    if param.len() != grad.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![param.len()],
            got: vec![grad.len()],
        });
    }
    Ok(())
}
