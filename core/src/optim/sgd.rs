use super::{Optimizer, check_lengths};
use crate::tensor::Result;
use rayon::prelude::*;

/// Stochastic Gradient Descent (SGD) optimizer.
///
/// Updates parameters using the rule:
/// `param = param - learning_rate * grad`
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, _key: usize, param: &mut [f32], grad: &[f32]) -> Result<()> {
        check_lengths(param, grad)?;
        let lr = self.learning_rate;
        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .for_each(|(p, g)| *p -= lr * g);
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}
