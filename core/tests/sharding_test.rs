use meshtrain::data::{BatchCollate, DataLoader, ShardingPacker, SyntheticConfig, SyntheticDataset, derive_partition};
use meshtrain::distributed::Cluster;
use meshtrain::mesh::{DeviceType, MeshDim, create_distributed_mesh};
use meshtrain::{MeshError, Tensor};

fn dims() -> Vec<MeshDim> {
    vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)]
}

#[test]
fn test_global_batch_split_over_replicas() {
    let shapes = Cluster::cpu(1, 8)
        .run(|client| {
            let mesh = create_distributed_mesh(&client, &dims(), DeviceType::Cpu, 8)?;
            let packer = ShardingPacker::new(&mesh, "batch")?;
            let labels = Tensor::<usize, 1>::new((0..32).collect(), [32])?;
            let packed = packer.pack(&labels)?;
            let firsts: Vec<usize> = packed.unpack().iter().map(|c| c.data()[0]).collect();
            Ok((packed.local_shape(), firsts))
        })
        .unwrap();

    let (local_shape, firsts) = &shapes[0];
    assert_eq!(local_shape, &[8]);
    // Devices 2k and 2k + 1 share batch coordinate k.
    assert_eq!(firsts, &vec![0, 0, 8, 8, 16, 16, 24, 24]);
}

#[test]
fn test_client_batches_reassemble_in_client_order() {
    let config = SyntheticConfig {
        batch_size: 16,
        sequence_length: 6,
        ..SyntheticConfig::default()
    };
    let results = Cluster::cpu(2, 4)
        .run(|client| {
            let mesh = create_distributed_mesh(&client, &dims(), DeviceType::Cpu, 8)?;
            let params = derive_partition(&client, &mesh, "batch")?;
            let local_batch = params.local_batch_size(32, mesh.dim_size("batch")?)?;
            let dataset = SyntheticDataset::generate(config, params.input_pipeline_id)?;
            let loader = DataLoader::<_, _, BatchCollate>::with_collate(dataset, local_batch);
            let batch = loader
                .iter()
                .next()
                .ok_or(MeshError::InputExhausted { steps: 0 })??;

            let sharded = ShardingPacker::new(&mesh, "batch")?.pack_batch(&batch)?;
            let global_ids = sharded.word_ids.to_global(&client)?;
            let global_labels = sharded.labels.to_global(&client)?;
            Ok((batch, sharded.global_rows(), global_ids, global_labels))
        })
        .unwrap();

    for (_, rows, ids, labels) in &results {
        assert_eq!(*rows, 32);
        assert_eq!(ids.shape(), &[32, 6]);
        let expected_labels: Vec<usize> = results
            .iter()
            .flat_map(|(batch, ..)| batch.labels.data().to_vec())
            .collect();
        assert_eq!(labels.data(), expected_labels.as_slice());
        let expected_ids: Vec<usize> = results
            .iter()
            .flat_map(|(batch, ..)| batch.word_ids.data().to_vec())
            .collect();
        assert_eq!(ids.data(), expected_ids.as_slice());
    }
    assert_ne!(results[0].0, results[1].0, "pipelines must draw different data");
}

#[test]
fn test_indivisible_batch_rejected() {
    let err = Cluster::cpu(2, 4)
        .run(|client| {
            let mesh = create_distributed_mesh(&client, &dims(), DeviceType::Cpu, 8)?;
            let packer = ShardingPacker::new(&mesh, "batch")?;
            packer.pack(&Tensor::<usize, 1>::new((0..15).collect(), [15])?)
        })
        .unwrap_err();
    assert!(
        matches!(err, MeshError::BatchNotDivisible { batch: 15, replicas: 2 }),
        "{err}"
    );
}

#[test]
fn test_local_batch_size_requires_divisible_global_batch() {
    let err = Cluster::cpu(2, 4)
        .run(|client| {
            let mesh = create_distributed_mesh(&client, &dims(), DeviceType::Cpu, 8)?;
            derive_partition(&client, &mesh, "batch")?.local_batch_size(30, 4)
        })
        .unwrap_err();
    assert!(matches!(err, MeshError::BatchNotDivisible { batch: 30, replicas: 4 }));
}
