use super::synthetic::Batch;
use crate::dtensor::{DTensor, Layout};
use crate::error::{MeshError, Result};
use crate::mesh::Mesh;
use crate::tensor::{Tensor, TensorElem};
use std::collections::BTreeMap;

/// Packs client-local batches into batch-sharded distributed tensors.
///
/// The local batch is split into one equal slice per batch coordinate hosted by this client.
/// Coordinates are ranked in ascending order and the coordinate of rank `k` receives slice
/// `k`. Every local device gets the slice of its own coordinate, so devices of the same batch
/// replica hold identical rows and no device sees another replica's rows.
#[derive(Debug, Clone)]
pub struct ShardingPacker {
    mesh: Mesh,
    batch_dim: String,
    replica_to_slice: BTreeMap<usize, usize>,
    /// Slice index of each local device, in local device order.
    device_slices: Vec<usize>,
}

impl ShardingPacker {
    pub fn new(mesh: &Mesh, batch_dim: &str) -> Result<Self> {
        let replica_to_slice: BTreeMap<usize, usize> = mesh
            .local_coordinates(batch_dim)?
            .into_iter()
            .enumerate()
            .map(|(slice, replica)| (replica, slice))
            .collect();
        let device_slices = mesh
            .local_device_locations()
            .iter()
            .map(|location| {
                location
                    .get(batch_dim)
                    .and_then(|replica| replica_to_slice.get(&replica).copied())
                    .ok_or_else(|| {
                        MeshError::Layout(format!(
                            "device {} has no {batch_dim} coordinate",
                            location.device
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mesh: mesh.clone(),
            batch_dim: batch_dim.to_string(),
            replica_to_slice,
            device_slices,
        })
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn batch_dim(&self) -> &str {
        &self.batch_dim
    }

    pub fn num_replicas(&self) -> usize {
        self.replica_to_slice.len()
    }

    /// Slice index assigned to batch coordinate `replica`, if this client hosts it.
    pub fn slice_of(&self, replica: usize) -> Option<usize> {
        self.replica_to_slice.get(&replica).copied()
    }

    /// Shards `tensor` along axis 0 over the batch dimension.
    pub fn pack<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<DTensor<T, RANK>> {
        let rows = tensor.shape().first().copied().unwrap_or(0);
        let replicas = self.num_replicas();
        if RANK == 0 || replicas == 0 || rows % replicas != 0 {
            return Err(MeshError::BatchNotDivisible {
                batch: rows,
                replicas,
            });
        }
        let slices = tensor.split_rows(replicas)?;
        let components = self
            .device_slices
            .iter()
            .map(|&slice| slices[slice].clone())
            .collect();
        let layout = Layout::batch_sharded(&self.mesh, &self.batch_dim, RANK)?;
        DTensor::pack(components, layout)
    }
}

/// A client-local [`Batch`] packed over the batch dimension.
#[derive(Debug, Clone)]
pub struct ShardedBatch {
    pub batch_dim: String,
    pub word_ids: DTensor<usize, 2>,
    pub mask: DTensor<usize, 2>,
    pub type_ids: DTensor<usize, 2>,
    pub labels: DTensor<usize, 1>,
}

impl ShardedBatch {
    /// Rows of the global batch across all clients.
    pub fn global_rows(&self) -> usize {
        self.labels.global_shape()[0]
    }
}

impl ShardingPacker {
    pub fn pack_batch(&self, batch: &Batch) -> Result<ShardedBatch> {
        Ok(ShardedBatch {
            batch_dim: self.batch_dim.clone(),
            word_ids: self.pack(&batch.word_ids)?,
            mask: self.pack(&batch.mask)?,
            type_ids: self.pack(&batch.type_ids)?,
            labels: self.pack(&batch.labels)?,
        })
    }
}
