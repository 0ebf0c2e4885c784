//! Activation functions and their derivatives.
//!
//! Backward helpers take what the forward pass already produced (the pre-activation for ReLU,
//! the output for tanh) so no extra state has to be kept on the tape.

use crate::tensor::{Cpu, Result, Tensor};

pub struct Activation;

impl Activation {
    /// `max(0, x)` element-wise.
    pub fn relu<const RANK: usize>(x: &Tensor<f32, RANK, Cpu>) -> Tensor<f32, RANK, Cpu> {
        x.map(|v| v.max(0.0))
    }

    /// Gradient of ReLU given the pre-activation `x` and upstream gradient `dy`.
    ///
    /// The derivative at exactly 0 is taken as 0.
    pub fn relu_backward<const RANK: usize>(
        x: &Tensor<f32, RANK, Cpu>,
        dy: &Tensor<f32, RANK, Cpu>,
    ) -> Result<Tensor<f32, RANK, Cpu>> {
        x.zip_map(dy, |v, g| if v > 0.0 { g } else { 0.0 })
    }

    pub fn tanh<const RANK: usize>(x: &Tensor<f32, RANK, Cpu>) -> Tensor<f32, RANK, Cpu> {
        x.map(f32::tanh)
    }

    /// Gradient of tanh given its output `y = tanh(x)`: `dy * (1 - y^2)`.
    pub fn tanh_backward<const RANK: usize>(
        y: &Tensor<f32, RANK, Cpu>,
        dy: &Tensor<f32, RANK, Cpu>,
    ) -> Result<Tensor<f32, RANK, Cpu>> {
        y.zip_map(dy, |t, g| g * (1.0 - t * t))
    }
}
