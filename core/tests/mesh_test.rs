use meshtrain::distributed::Cluster;
use meshtrain::mesh::{DeviceType, MeshDim, create_distributed_mesh};
use meshtrain::{MeshError, current_mesh, run_on};

fn batch_model(batch: usize, model: usize) -> Vec<MeshDim> {
    vec![MeshDim::new("batch", batch), MeshDim::new("model", model)]
}

#[test]
fn test_mesh_spans_all_clients() {
    let views = Cluster::cpu(2, 4)
        .run(|client| {
            let mesh = create_distributed_mesh(&client, &batch_model(4, 2), DeviceType::Cpu, 8)?;
            Ok((
                mesh.local_device_ids().to_vec(),
                mesh.local_coordinates("model")?,
                mesh.device_name(mesh.local_device_ids()[0]),
            ))
        })
        .unwrap();

    assert_eq!(views[0].0, vec![0, 1, 2, 3]);
    assert_eq!(views[1].0, vec![4, 5, 6, 7]);
    assert_eq!(views[0].1, vec![0, 1]);
    assert_eq!(views[1].2, "/job:worker/replica:0/task:1/device:CPU:0");
}

#[test]
fn test_dims_must_cover_declared_devices() {
    let err = Cluster::cpu(2, 4)
        .run(|client| create_distributed_mesh(&client, &batch_model(3, 2), DeviceType::Cpu, 8))
        .unwrap_err();
    assert!(matches!(err, MeshError::Topology(_)), "{err}");
}

#[test]
fn test_client_without_enough_devices() {
    let err = Cluster::cpu(2, 2)
        .run(|client| create_distributed_mesh(&client, &batch_model(4, 2), DeviceType::Cpu, 8))
        .unwrap_err();
    assert!(matches!(err, MeshError::Topology(msg) if msg.contains("local devices")));
}

#[test]
fn test_device_type_must_match_client() {
    let err = Cluster::cpu(2, 4)
        .run(|client| create_distributed_mesh(&client, &batch_model(4, 2), DeviceType::Gpu, 8))
        .unwrap_err();
    assert!(matches!(err, MeshError::Topology(_)), "{err}");
}

#[test]
fn test_rendezvous_rejects_divergent_meshes() {
    let err = Cluster::cpu(2, 4)
        .run(|client| {
            let dims = if client.id() == 0 {
                batch_model(4, 2)
            } else {
                batch_model(2, 4)
            };
            create_distributed_mesh(&client, &dims, DeviceType::Cpu, 8)
        })
        .unwrap_err();
    assert!(matches!(err, MeshError::Consistency(_)), "{err}");
}

#[test]
fn test_scope_is_per_client_thread() {
    let seen = Cluster::cpu(2, 4)
        .run(|client| {
            let mesh = create_distributed_mesh(&client, &batch_model(4, 2), DeviceType::Cpu, 8)?;
            assert!(matches!(current_mesh(), Err(MeshError::NoMeshInScope)));
            let inside = run_on(&mesh, current_mesh)?;
            Ok(inside.client_id())
        })
        .unwrap();
    assert_eq!(seen, vec![0, 1]);
}
