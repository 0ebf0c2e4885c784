use crate::distributed::{Client, CollectiveBackend};
use crate::error::{MeshError, Result};
use crate::mesh::{Mesh, current_mesh};
use crate::nn::Module;
use crate::tensor::{Cpu, Tensor};

/// The rows of a batch a client evaluates, as plain tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInputs {
    pub word_ids: Tensor<usize, 2, Cpu>,
    pub mask: Tensor<usize, 2, Cpu>,
    pub type_ids: Tensor<usize, 2, Cpu>,
}

impl ModelInputs {
    pub fn rows(&self) -> usize {
        self.word_ids.shape()[0]
    }

    /// Zero rows of length `seq`, for a client that owns no batch replica.
    pub fn empty(seq: usize) -> Self {
        Self {
            word_ids: Tensor::zeros([0, seq]),
            mask: Tensor::zeros([0, seq]),
            type_ids: Tensor::zeros([0, seq]),
        }
    }
}

/// A trainable model over a mesh.
///
/// `forward` is a collective: parameters are gathered from their shards, so every client must
/// call it once per step even when it evaluates zero rows. It must run inside
/// [`run_on`](crate::mesh::run_on) for the model's own mesh.
pub trait Model: Module {
    /// Activations recorded by a training forward pass.
    type Tape: Send;

    fn mesh(&self) -> &Mesh;

    /// Returns `[rows, classes]` logits, and a tape when `training`.
    fn forward<B: CollectiveBackend>(
        &self,
        client: &Client<B>,
        inputs: &ModelInputs,
        training: bool,
    ) -> Result<(Tensor<f32, 2, Cpu>, Option<Self::Tape>)>;

    /// Gradient of every trainable parameter with respect to the summed loss, as flat global
    /// tensors in [`Module::trainable_parameters`] order.
    fn backward(&self, tape: Self::Tape, d_logits: &Tensor<f32, 2, Cpu>) -> Result<Vec<Vec<f32>>>;
}

/// Fails unless the ambient mesh is `mesh`.
pub(crate) fn ensure_in_scope(mesh: &Mesh) -> Result<()> {
    let current = current_mesh()?;
    if current != *mesh {
        return Err(MeshError::Consistency(format!(
            "model lives on {mesh} but the current mesh is {current}"
        )));
    }
    Ok(())
}
