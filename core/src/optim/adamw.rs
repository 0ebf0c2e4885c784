use super::{Optimizer, check_lengths};
use crate::tensor::Result;
use rayon::prelude::*;
use std::collections::HashMap;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
/// With `weight_decay = 0` this is plain Adam.
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
pub struct AdamW {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    state: HashMap<usize, Moments>,
}

struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    step: i32,
}

impl AdamW {
    /// AdamW with `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-7`, `weight_decay = 0.01`.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            weight_decay: 0.01,
            state: HashMap::new(),
        }
    }

    pub fn adam(learning_rate: f32) -> Self {
        Self::new(learning_rate).with_weight_decay(0.0)
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Steps taken for shard `key`.
    pub fn steps(&self, key: usize) -> usize {
        self.state.get(&key).map_or(0, |s| s.step as usize)
    }
}

impl Optimizer for AdamW {
    fn update(&mut self, key: usize, param: &mut [f32], grad: &[f32]) -> Result<()> {
        check_lengths(param, grad)?;

        let size = param.len();
        let moments = self.state.entry(key).or_insert_with(|| Moments {
            m: vec![0.0; size],
            v: vec![0.0; size],
            step: 0,
        });
        moments.step += 1;

        let (lr, b1, b2, eps, lambda) = (
            self.learning_rate,
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
        );
        let bias_correction1 = 1.0 - b1.powi(moments.step);
        let bias_correction2 = 1.0 - b2.powi(moments.step);

        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(moments.m.par_iter_mut())
            .zip(moments.v.par_iter_mut())
            .for_each(|(((p, &g), m), v)| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
            });

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}
