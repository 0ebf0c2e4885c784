use meshtrain::MeshError;
use meshtrain::data::{PipelineParams, derive_partition};
use meshtrain::distributed::{Cluster, all_distinct_values};
use meshtrain::mesh::{DeviceType, MeshDim, create_distributed_mesh};

fn partitions(
    num_clients: usize,
    devices_per_client: usize,
    dims: &[MeshDim],
) -> meshtrain::Result<Vec<PipelineParams>> {
    let num_devices = num_clients * devices_per_client;
    Cluster::cpu(num_clients, devices_per_client).run(|client| {
        let mesh = create_distributed_mesh(&client, dims, DeviceType::Cpu, num_devices)?;
        derive_partition(&client, &mesh, "batch")
    })
}

#[test]
fn test_two_clients_on_batch_major_mesh() {
    // Client 0 hosts batch coordinates {0, 1}, client 1 hosts {2, 3}.
    let params = partitions(2, 4, &[MeshDim::new("batch", 4), MeshDim::new("model", 2)]).unwrap();
    assert_eq!(
        params,
        vec![
            PipelineParams {
                input_pipeline_id: 0,
                num_input_pipelines: 2,
                num_local_replicas_in_sync: 2,
            },
            PipelineParams {
                input_pipeline_id: 1,
                num_input_pipelines: 2,
                num_local_replicas_in_sync: 2,
            },
        ]
    );
    assert_eq!(params[1].local_batch_size(32, 4).unwrap(), 16);
}

#[test]
fn test_one_pipeline_per_client_when_pure_data_parallel() {
    let params = partitions(4, 2, &[MeshDim::new("batch", 8)]).unwrap();
    let ids: Vec<_> = params.iter().map(|p| p.input_pipeline_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert!(params.iter().all(|p| p.num_input_pipelines == 4));
    assert!(params.iter().all(|p| p.num_local_replicas_in_sync == 2));
}

#[test]
fn test_clients_sharing_replicas_share_a_pipeline() {
    // Model-major: every client hosts both batch coordinates.
    let params = partitions(2, 4, &[MeshDim::new("model", 2), MeshDim::new("batch", 4)]).unwrap();
    assert_eq!(params[0], params[1]);
    assert_eq!(params[0].input_pipeline_id, 0);
    assert_eq!(params[0].num_input_pipelines, 1);
    assert_eq!(params[0].num_local_replicas_in_sync, 4);
}

#[test]
fn test_non_contiguous_replicas_rejected() {
    // On a 2x3 mesh split over three clients, client 1 hosts devices 2 and 3, whose batch
    // coordinates are {2, 0}.
    let err = partitions(3, 2, &[MeshDim::new("outer", 2), MeshDim::new("batch", 3)]).unwrap_err();
    assert!(
        matches!(&err, MeshError::Consistency(msg) if msg.contains("non-contiguous")),
        "{err}"
    );
}

#[test]
fn test_distinct_values_over_many_clients() {
    let submitted = [9, 3, 9, 3, 0];
    let results = Cluster::cpu(5, 1)
        .run(|client| all_distinct_values(&client, submitted[client.id()]))
        .unwrap();
    for values in results {
        assert_eq!(values, vec![0, 3, 9]);
    }
}

#[test]
fn test_unknown_batch_dim() {
    let err = partitions(2, 4, &[MeshDim::new("data", 4), MeshDim::new("model", 2)]).unwrap_err();
    assert!(matches!(err, MeshError::Layout(_)), "{err}");
}

#[test]
fn test_distinct_values_beyond_f64_precision() {
    let big = (1_i64 << 53) + 1;
    let submitted = [big, -big, big, i64::MAX];
    let results = Cluster::cpu(4, 1)
        .run(|client| all_distinct_values(&client, submitted[client.id()]))
        .unwrap();
    for values in results {
        assert_eq!(values, vec![-big, big, i64::MAX]);
    }
}
