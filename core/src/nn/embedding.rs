use crate::tensor::{Cpu, Result, Tensor, TensorError};

/// Table lookup: row `id` of `weight` for every id.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub weight: Tensor<f32, 2, Cpu>,
}

impl Embedding {
    pub fn new(weight: Tensor<f32, 2, Cpu>) -> Self {
        Self { weight }
    }

    fn check(&self, id: usize) -> Result<()> {
        let [vocab_size, hidden] = *self.weight.shape();
        if id >= vocab_size {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![id],
                shape: vec![vocab_size, hidden],
            });
        }
        Ok(())
    }

    /// `[batch, seq]` ids -> `[batch, seq, hidden]`.
    pub fn forward(&self, ids: &Tensor<usize, 2, Cpu>) -> Result<Tensor<f32, 3, Cpu>> {
        let [batch, seq] = *ids.shape();
        let hidden = self.weight.shape()[1];
        let weight = self.weight.data();

        let mut out = Tensor::zeros([batch, seq, hidden]);
        for (row, &id) in out.data_mut().chunks_mut(hidden.max(1)).zip(ids.data()) {
            self.check(id)?;
            row.copy_from_slice(&weight[id * hidden..(id + 1) * hidden]);
        }
        Ok(out)
    }

    /// Scatter-adds `d_out` (`[batch, seq, hidden]`) into a gradient for `weight`.
    pub fn backward(
        &self,
        ids: &Tensor<usize, 2, Cpu>,
        d_out: &Tensor<f32, 3, Cpu>,
    ) -> Result<Tensor<f32, 2, Cpu>> {
        let hidden = self.weight.shape()[1];
        let mut grad = Tensor::zeros(*self.weight.shape());
        let grad_data = grad.data_mut();
        for (row, &id) in d_out.data().chunks(hidden.max(1)).zip(ids.data()) {
            self.check(id)?;
            for (g, &d) in grad_data[id * hidden..(id + 1) * hidden].iter_mut().zip(row) {
                *g += d;
            }
        }
        Ok(grad)
    }
}
