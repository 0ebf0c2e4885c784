//! Loss functions.
//!
//! Losses return the *sum* over the rows they are given together with the gradient of that
//! sum. A training step evaluates the loss on the rows this client owns, sums the results
//! across clients, and only then divides by the global batch size.

use crate::tensor::{Cpu, Result, Tensor, TensorError};

/// Summed loss and its gradient with respect to the predictions.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub sum: f32,
    pub grad: Tensor<f32, 2, Cpu>,
}

pub trait Loss: Send + Sync {
    /// `predictions`: `[rows, classes]`, `labels`: `[rows]`.
    fn sum_and_grad(
        &self,
        predictions: &Tensor<f32, 2, Cpu>,
        labels: &Tensor<usize, 1, Cpu>,
    ) -> Result<LossOutput>;
}

/// Cross entropy against integer class labels.
///
/// With `from_logits` the predictions are unnormalised scores and go through a softmax
/// first; otherwise they are taken to be probabilities.
#[derive(Debug, Clone, Copy)]
pub struct SparseCategoricalCrossentropy {
    pub from_logits: bool,
}

impl SparseCategoricalCrossentropy {
    pub fn new(from_logits: bool) -> Self {
        Self { from_logits }
    }
}

const PROB_EPSILON: f32 = 1e-7;

impl Loss for SparseCategoricalCrossentropy {
    fn sum_and_grad(
        &self,
        predictions: &Tensor<f32, 2, Cpu>,
        labels: &Tensor<usize, 1, Cpu>,
    ) -> Result<LossOutput> {
        let [rows, classes] = *predictions.shape();
        if labels.shape()[0] != rows {
            return Err(TensorError::ShapeMismatch {
                expected: vec![rows],
                got: labels.shape().to_vec(),
            });
        }

        let mut sum = 0.0f32;
        let mut grad = vec![0.0f32; rows * classes];
        for (row, &label) in labels.data().iter().enumerate() {
            if label >= classes {
                return Err(TensorError::IndexOutOfBounds {
                    index: vec![row, label],
                    shape: vec![rows, classes],
                });
            }
            let scores = &predictions.data()[row * classes..(row + 1) * classes];
            let out = &mut grad[row * classes..(row + 1) * classes];
            if self.from_logits {
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exp_sum: f32 = scores.iter().map(|s| (s - max).exp()).sum();
                let log_norm = max + exp_sum.ln();
                sum += log_norm - scores[label];
                for (g, &s) in out.iter_mut().zip(scores) {
                    *g = (s - log_norm).exp();
                }
                out[label] -= 1.0;
            } else {
                let p = scores[label].clamp(PROB_EPSILON, 1.0);
                sum -= p.ln();
                out[label] = -1.0 / p;
            }
        }
        Ok(LossOutput {
            sum,
            grad: Tensor::new(grad, [rows, classes])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits() {
        let loss = SparseCategoricalCrossentropy::new(true);
        let logits = Tensor::new(vec![0.0, 0.0, 3.0, 3.0], [2, 2]).unwrap();
        let labels = Tensor::new(vec![0, 1], [2]).unwrap();
        let out = loss.sum_and_grad(&logits, &labels).unwrap();
        assert!((out.sum - 2.0 * 2f32.ln()).abs() < 1e-6);
        for (g, want) in out.grad.data().iter().zip([-0.5, 0.5, 0.5, -0.5]) {
            assert!((g - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let loss = SparseCategoricalCrossentropy::new(true);
        let logits = Tensor::new(vec![0.3, -1.2, 2.0], [1, 3]).unwrap();
        let labels = Tensor::new(vec![2], [1]).unwrap();
        let out = loss.sum_and_grad(&logits, &labels).unwrap();

        let h = 1e-3;
        for i in 0..3 {
            let mut bumped = logits.clone();
            bumped.data_mut()[i] += h;
            let up = loss.sum_and_grad(&bumped, &labels).unwrap().sum;
            let numeric = (up - out.sum) / h;
            assert!((numeric - out.grad.data()[i]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_probabilities() {
        let loss = SparseCategoricalCrossentropy::new(false);
        let probs = Tensor::new(vec![0.25, 0.75], [1, 2]).unwrap();
        let labels = Tensor::new(vec![1], [1]).unwrap();
        let out = loss.sum_and_grad(&probs, &labels).unwrap();
        assert!((out.sum + 0.75f32.ln()).abs() < 1e-6);
        assert!((out.grad.data()[1] + 1.0 / 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_label_out_of_range() {
        let loss = SparseCategoricalCrossentropy::new(true);
        let logits = Tensor::zeros([1, 2]);
        let labels = Tensor::new(vec![2], [1]).unwrap();
        assert!(matches!(
            loss.sum_and_grad(&logits, &labels),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }
}
