use meshtrain::checkpoint::DTensorCheckpoint;
use meshtrain::distributed::{Client, Cluster};
use meshtrain::mesh::{DeviceType, MeshDim, create_distributed_mesh};
use meshtrain::models::{BertClassifier, BertConfig, default_layout_map};
use meshtrain::nn::{Module, ParameterBuilder};
use meshtrain::{Mesh, MeshError, run_on};
use std::path::Path;
use tempfile::tempdir;

fn config(num_layers: usize) -> BertConfig {
    BertConfig {
        hidden_size: 8,
        intermediate_size: 16,
        num_layers,
        ..BertConfig::default()
    }
}

fn build(client: &Client, dims: &[MeshDim], seed: u64, num_layers: usize) -> meshtrain::Result<(Mesh, BertClassifier)> {
    let mesh = create_distributed_mesh(client, dims, DeviceType::Cpu, 8)?;
    let map = default_layout_map(&mesh, "model")?;
    let mut builder = ParameterBuilder::new(&map, seed);
    let model = run_on(&mesh, || BertClassifier::new(config(num_layers), &mut builder))?;
    Ok((mesh, model))
}

fn batch_major() -> Vec<MeshDim> {
    vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)]
}

fn snapshot(model: &BertClassifier) -> Vec<Vec<f32>> {
    model
        .trainable_parameters()
        .iter()
        .flat_map(|p| p.local_shards().into_iter().map(|(_, shard)| shard.to_vec()))
        .collect()
}

fn scramble(model: &mut BertClassifier) {
    for param in model.trainable_parameters_mut() {
        for (_, shard) in param.local_shards_mut() {
            shard.fill(f32::NAN);
        }
    }
}

fn round_trip(prefix: &str) -> Vec<(String, bool)> {
    Cluster::cpu(2, 4)
        .run(|client| {
            let (mesh, mut model) = build(&client, &batch_major(), 3, 2)?;
            let before = snapshot(&model);

            let mut checkpoint = DTensorCheckpoint::new(&mesh);
            let token = checkpoint.save(&client, &model, prefix)?;
            assert_eq!(checkpoint.save_counter(), 1);

            scramble(&mut model);
            checkpoint.restore(&client, &mut model, &token)?;
            let after = snapshot(&model);
            let identical = before.len() == after.len()
                && before
                    .iter()
                    .flatten()
                    .zip(after.iter().flatten())
                    .all(|(a, b)| a.to_bits() == b.to_bits());
            Ok((token, identical))
        })
        .unwrap()
}

#[test]
fn test_save_restore_on_disk() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("bert-checkpoint").to_string_lossy().into_owned();
    let results = round_trip(&prefix);

    for (token, identical) in &results {
        assert_eq!(token, &format!("{prefix}-1"));
        assert!(identical);
    }
    let saved = dir.path().join("bert-checkpoint-1");
    assert!(saved.join("index.json").exists());
    assert!(saved.join("shard-00000-of-00002.safetensors").exists());
    assert!(saved.join("shard-00001-of-00002.safetensors").exists());
}

#[test]
fn test_save_restore_in_memory() {
    let results = round_trip("mem://checkpoint-test/round-trip");
    assert!(results.iter().all(|(_, identical)| *identical));
}

#[test]
fn test_file_uri_prefix() {
    let dir = tempdir().unwrap();
    let prefix = format!("file://{}/cpt", dir.path().display());
    let results = round_trip(&prefix);
    assert!(results.iter().all(|(_, identical)| *identical));
    assert!(dir.path().join("cpt-1").join("index.json").exists());
}

#[test]
fn test_restore_into_different_mesh_rejected() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("cpt").to_string_lossy().into_owned();

    let err = Cluster::cpu(2, 4)
        .run(|client| {
            let (mesh, model) = build(&client, &batch_major(), 3, 2)?;
            let token = DTensorCheckpoint::new(&mesh).save(&client, &model, &prefix)?;

            let model_major = [MeshDim::new("batch", 2), MeshDim::new("model", 4)];
            let (other_mesh, mut other) = build(&client, &model_major, 5, 2)?;
            let untouched = snapshot(&other);
            let result = DTensorCheckpoint::new(&other_mesh).restore(&client, &mut other, &token);
            assert_eq!(snapshot(&other), untouched);
            result
        })
        .unwrap_err();
    assert!(matches!(err, MeshError::CheckpointMismatch(_)), "{err}");
}

#[test]
fn test_missing_shard_on_one_client_leaves_every_client_untouched() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("cpt").to_string_lossy().into_owned();

    let results = Cluster::cpu(2, 4)
        .run(|client| {
            let (mesh, mut model) = build(&client, &batch_major(), 3, 2)?;
            let mut checkpoint = DTensorCheckpoint::new(&mesh);
            let token = checkpoint.save(&client, &model, &prefix)?;
            if client.is_leader() {
                std::fs::remove_file(Path::new(&token).join("shard-00001-of-00002.safetensors")).unwrap();
            }
            client.barrier()?;

            for param in model.trainable_parameters_mut() {
                for (_, shard) in param.local_shards_mut() {
                    shard.fill(42.0);
                }
            }
            let result = checkpoint.restore(&client, &mut model, &token);
            let untouched = snapshot(&model).iter().flatten().all(|&v| v == 42.0);
            Ok((client.id(), result.err(), untouched))
        })
        .unwrap();

    for (id, err, untouched) in results {
        assert!(untouched, "client {id} overwrote its parameters");
        match err {
            Some(MeshError::Storage(msg)) if id == 0 => assert!(msg.contains("client 1"), "{msg}"),
            Some(MeshError::Storage(_)) => {}
            other => panic!("client {id}: expected a storage error, got {other:?}"),
        }
    }
}

#[test]
fn test_restore_into_different_model_rejected() {
    let err = Cluster::cpu(2, 4)
        .run(|client| {
            let (mesh, model) = build(&client, &batch_major(), 3, 2)?;
            let token = DTensorCheckpoint::new(&mesh).save(&client, &model, "mem://checkpoint-test/layers")?;

            let (mesh, mut deeper) = build(&client, &batch_major(), 3, 3)?;
            DTensorCheckpoint::new(&mesh).restore(&client, &mut deeper, &token)
        })
        .unwrap_err();
    assert!(matches!(err, MeshError::CheckpointMismatch(_)), "{err}");
}

#[test]
fn test_remote_storage_unsupported() {
    let err = Cluster::cpu(2, 4)
        .run(|client| {
            let (mesh, model) = build(&client, &batch_major(), 3, 2)?;
            DTensorCheckpoint::new(&mesh).save(&client, &model, "gs://bucket/cpt")
        })
        .unwrap_err();
    assert!(matches!(err, MeshError::UnsupportedStorage(uri) if uri == "gs://bucket/cpt-1"));
}

#[test]
fn test_missing_checkpoint() {
    let dir = tempdir().unwrap();
    let token = dir.path().join("never-saved").to_string_lossy().into_owned();
    let err = Cluster::cpu(1, 8)
        .run(|client| {
            let (mesh, mut model) = build(&client, &batch_major(), 3, 2)?;
            DTensorCheckpoint::new(&mesh).restore(&client, &mut model, &token)
        })
        .unwrap_err();
    assert!(matches!(err, MeshError::Storage(_)), "{err}");
}
