use crate::distributed::{Client, CollectiveBackend, all_distinct_values};
use crate::error::{MeshError, Result};
use crate::mesh::Mesh;
use serde::Serialize;

/// Which input pipeline this client runs.
///
/// Clients that host the same batch replicas run the same pipeline and produce the same data;
/// clients with disjoint replicas run different pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineParams {
    /// `0..num_input_pipelines`, dense and identical in rule on every client.
    pub input_pipeline_id: usize,
    pub num_input_pipelines: usize,
    /// Distinct batch coordinates among this client's devices.
    pub num_local_replicas_in_sync: usize,
}

impl PipelineParams {
    /// Rows this client feeds per step for a global batch of `global_batch` rows.
    pub fn local_batch_size(&self, global_batch: usize, batch_dim_size: usize) -> Result<usize> {
        if batch_dim_size == 0 || global_batch % batch_dim_size != 0 {
            return Err(MeshError::BatchNotDivisible {
                batch: global_batch,
                replicas: batch_dim_size,
            });
        }
        Ok(global_batch / batch_dim_size * self.num_local_replicas_in_sync)
    }
}

/// Derives this client's input pipeline without a coordinator. Collective.
///
/// The smallest batch coordinate hosted by this client stands for the client; the rank of
/// that value among all clients' values is the pipeline id.
pub fn derive_partition<B: CollectiveBackend>(
    client: &Client<B>,
    mesh: &Mesh,
    batch_dim: &str,
) -> Result<PipelineParams> {
    let replicas = mesh.local_coordinates(batch_dim)?;
    let (first, last) = match (replicas.first(), replicas.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => {
            return Err(MeshError::Topology(format!(
                "client {} hosts no devices of mesh {mesh}",
                client.id()
            )));
        }
    };
    if last - first + 1 != replicas.len() {
        return Err(MeshError::Consistency(format!(
            "client {} hosts non-contiguous {batch_dim} coordinates {replicas:?}",
            client.id()
        )));
    }

    let representatives = all_distinct_values(client, first as i64)?;
    let input_pipeline_id = representatives
        .iter()
        .position(|&v| v == first as i64)
        .ok_or_else(|| {
            MeshError::Consistency(format!(
                "representative {first} missing from consensus result {representatives:?}"
            ))
        })?;

    let params = PipelineParams {
        input_pipeline_id,
        num_input_pipelines: representatives.len(),
        num_local_replicas_in_sync: replicas.len(),
    };
    let batch_dim_size = mesh.dim_size(batch_dim)?;
    if params.num_input_pipelines * params.num_local_replicas_in_sync != batch_dim_size {
        return Err(MeshError::Consistency(format!(
            "{} pipelines of {} replicas do not tile a {batch_dim} dimension of size {batch_dim_size}",
            params.num_input_pipelines, params.num_local_replicas_in_sync
        )));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(local: usize) -> PipelineParams {
        PipelineParams {
            input_pipeline_id: 0,
            num_input_pipelines: 4 / local,
            num_local_replicas_in_sync: local,
        }
    }

    #[test]
    fn test_local_batch_size() {
        assert_eq!(params(2).local_batch_size(32, 4).unwrap(), 16);
        assert_eq!(params(1).local_batch_size(32, 4).unwrap(), 8);
        assert!(matches!(
            params(2).local_batch_size(30, 4),
            Err(MeshError::BatchNotDivisible { batch: 30, replicas: 4 })
        ));
    }
}
