use crate::tensor::{Cpu, Result, Tensor, TensorError, TensorOps};

/// Fully connected layer: `y = x · kernel + bias`.
///
/// - `kernel`: `[in_features, out_features]`
/// - `bias`: `[out_features]`
#[derive(Debug, Clone)]
pub struct Dense {
    pub kernel: Tensor<f32, 2, Cpu>,
    pub bias: Tensor<f32, 1, Cpu>,
}

/// Gradients of a [`Dense`] layer.
#[derive(Debug, Clone)]
pub struct DenseGrads {
    pub input: Tensor<f32, 2, Cpu>,
    pub kernel: Tensor<f32, 2, Cpu>,
    pub bias: Tensor<f32, 1, Cpu>,
}

impl Dense {
    pub fn new(kernel: Tensor<f32, 2, Cpu>, bias: Tensor<f32, 1, Cpu>) -> Result<Self> {
        if kernel.shape()[1] != bias.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![kernel.shape()[1]],
                got: bias.shape().to_vec(),
            });
        }
        Ok(Self { kernel, bias })
    }

    /// `[batch, in] -> [batch, out]`
    pub fn forward(&self, x: &Tensor<f32, 2, Cpu>) -> Result<Tensor<f32, 2, Cpu>> {
        x.matmul(&self.kernel)?.add_row(&self.bias)
    }

    /// Backpropagates `dy` (`[batch, out]`) through the layer given its input `x`.
    pub fn backward(
        &self,
        x: &Tensor<f32, 2, Cpu>,
        dy: &Tensor<f32, 2, Cpu>,
    ) -> Result<DenseGrads> {
        Ok(DenseGrads {
            input: dy.matmul(&self.kernel.transpose()?)?,
            kernel: x.transpose()?.matmul(dy)?,
            bias: dy.sum_rows(),
        })
    }
}
