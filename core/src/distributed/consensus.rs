use super::backend::CollectiveBackend;
use super::client::{CLIENTS_DIM, Client};
use crate::dtensor::{DTensor, Layout};
use crate::error::Result;
use crate::tensor::Tensor;

/// Returns the sorted set of distinct values submitted by all clients.
///
/// Collective: every client must call this once per round, in the same order relative to
/// every other collective. Each client packs its value into a tensor sharded over the client
/// mesh, relayouts it to fully replicated so that every client holds every value, then
/// deduplicates locally.
pub fn all_distinct_values<B: CollectiveBackend>(
    client: &Client<B>,
    local_value: i64,
) -> Result<Vec<i64>> {
    let mesh = client.client_mesh()?;
    let sharded = Layout::new(&[CLIENTS_DIM], mesh)?;
    let packed = DTensor::pack(vec![Tensor::<i64, 1>::new(vec![local_value], [1])?], sharded)?;

    let replicated = packed.relayout(Layout::replicated(mesh, 1), client)?;
    let mut values = replicated
        .unpack()
        .first()
        .map(|component| component.data().to_vec())
        .unwrap_or_default();
    values.sort_unstable();
    values.dedup();

    tracing::debug!(local_value, ?values, "distinct values across clients");
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::Cluster;

    #[test]
    fn test_values_are_sorted_and_deduplicated() {
        let submitted = [5, 1, 5, 3];
        let results = Cluster::cpu(4, 1)
            .run(|client| all_distinct_values(&client, submitted[client.id()]))
            .unwrap();
        for values in results {
            assert_eq!(values, vec![1, 3, 5]);
        }
    }

    #[test]
    fn test_client_mesh_built_once() {
        let results = Cluster::cpu(2, 1)
            .run(|client| {
                let first = all_distinct_values(&client, client.id() as i64)?;
                assert!(client.has_client_mesh());
                let second = all_distinct_values(&client, 7)?;
                Ok((first, second))
            })
            .unwrap();
        assert_eq!(results[0], (vec![0, 1], vec![7]));
        assert_eq!(results[1], (vec![0, 1], vec![7]));
    }
}
