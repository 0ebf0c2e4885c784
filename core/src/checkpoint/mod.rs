//! Distributed checkpoints.
//!
//! A checkpoint is a directory-like location holding one `safetensors` file per client, with
//! that client's local shards stored as `<parameter>@<device>`, plus an `index.json` written
//! by the leader. The index records the mesh, every parameter's global shape and sharding,
//! and which file holds which device.
//!
//! Saving and restoring are collectives. A checkpoint only restores into the mesh and
//! parameter layout it was saved from; anything else fails before a single parameter is
//! touched.

pub mod store;

pub use store::{BlobStore, FileStore, MemoryStore, join_key, open_store};

use crate::distributed::{Client, CollectiveBackend};
use crate::error::{MeshError, Result};
use crate::mesh::{Mesh, MeshDescription};
use crate::nn::Module;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ParameterEntry {
    name: String,
    global_shape: Vec<usize>,
    sharding_specs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointIndex {
    mesh: MeshDescription,
    num_clients: usize,
    parameters: Vec<ParameterEntry>,
    /// Global device id -> shard file name.
    devices: BTreeMap<usize, String>,
}

fn shard_file(client: usize, num_clients: usize) -> String {
    format!("shard-{client:05}-of-{num_clients:05}.safetensors")
}

fn tensor_key(parameter: &str, device: usize) -> String {
    format!("{parameter}@{device}")
}

fn entries<M: Module + ?Sized>(root: &M) -> Vec<ParameterEntry> {
    root.trainable_parameters()
        .iter()
        .map(|p| ParameterEntry {
            name: p.name().to_string(),
            global_shape: p.global_shape(),
            sharding_specs: p.layout().sharding_specs(),
        })
        .collect()
}

/// Saves and restores every trainable parameter of a model on a mesh.
pub struct DTensorCheckpoint {
    mesh: Mesh,
    save_counter: usize,
}

impl DTensorCheckpoint {
    pub fn new(mesh: &Mesh) -> Self {
        Self {
            mesh: mesh.clone(),
            save_counter: 0,
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Number of completed saves.
    pub fn save_counter(&self) -> usize {
        self.save_counter
    }

    /// Writes `root` under `<prefix>-<n>`, where `n` counts saves from 1, and returns that
    /// location as the restore token. Collective.
    pub fn save<M, B>(&mut self, client: &Client<B>, root: &M, prefix: &str) -> Result<String>
    where
        M: Module + ?Sized,
        B: CollectiveBackend,
    {
        let number = self.save_counter + 1;
        let token = format!("{prefix}-{number}");
        let (store, base) = open_store(&token)?;

        let num_clients = self.mesh.num_clients();
        let file = shard_file(self.mesh.client_id(), num_clients);
        let params = root.trainable_parameters();
        let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = params
            .iter()
            .flat_map(|p| {
                let local_shape = p.local_shape();
                p.local_shards().into_iter().map(move |(device, shard)| {
                    (
                        tensor_key(p.name(), device),
                        local_shape.clone(),
                        shard.iter().flat_map(|v| v.to_le_bytes()).collect(),
                    )
                })
            })
            .collect();
        let views = bytes
            .iter()
            .map(|(key, shape, data)| Ok((key.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?)))
            .collect::<Result<Vec<_>>>()?;
        store.put(&join_key(&base, &file), &safetensors::serialize(views, None)?)?;
        client.barrier()?;

        if client.is_leader() {
            let index = CheckpointIndex {
                mesh: self.mesh.description().clone(),
                num_clients,
                parameters: entries(root),
                devices: (0..self.mesh.num_devices())
                    .map(|d| (d, shard_file(self.mesh.client_of(d), num_clients)))
                    .collect(),
            };
            store.put(&join_key(&base, INDEX_FILE), &serde_json::to_vec_pretty(&index)?)?;
            info!(token = %token, parameters = index.parameters.len(), "saved checkpoint");
        }
        client.barrier()?;

        self.save_counter = number;
        Ok(token)
    }

    /// Restores `root` from a token returned by [`save`](Self::save). Collective.
    ///
    /// Every client reads and checks its shards before any client writes a parameter.
    pub fn restore<M, B>(&self, client: &Client<B>, root: &mut M, token: &str) -> Result<()>
    where
        M: Module + ?Sized,
        B: CollectiveBackend,
    {
        let staged = self.stage(&*root, token);
        let status = staged.as_ref().err().map(ToString::to_string);
        let statuses = client.all_gather_bytes(serde_json::to_vec(&status)?)?;
        let staged = staged?;
        for (peer, bytes) in statuses.iter().enumerate() {
            if let Some(msg) = serde_json::from_slice::<Option<String>>(bytes)? {
                return Err(MeshError::Storage(format!(
                    "client {peer} could not restore {token}: {msg}"
                )));
            }
        }

        for (param, shards) in root.trainable_parameters_mut().into_iter().zip(staged) {
            for ((_, dst), src) in param.local_shards_mut().into_iter().zip(shards) {
                dst.copy_from_slice(&src);
            }
        }
        client.barrier()?;
        if client.is_leader() {
            info!(token, "restored checkpoint");
        }
        Ok(())
    }

    /// Reads and validates this client's shards of every parameter of `root` without
    /// touching it.
    fn stage<M: Module + ?Sized>(&self, root: &M, token: &str) -> Result<Vec<Vec<Vec<f32>>>> {
        let (store, base) = open_store(token)?;
        let index: CheckpointIndex = serde_json::from_slice(&store.get(&join_key(&base, INDEX_FILE))?)?;

        if index.mesh != *self.mesh.description() || index.num_clients != self.mesh.num_clients() {
            return Err(MeshError::CheckpointMismatch(format!(
                "checkpoint {token} was saved on {} devices ({} clients) as {:?}, restoring on {}",
                index.mesh.num_devices,
                index.num_clients,
                index.mesh.dims,
                self.mesh
            )));
        }
        let expected = entries(root);
        if index.parameters != expected {
            let diff = index
                .parameters
                .iter()
                .zip(&expected)
                .find(|(saved, live)| saved != live)
                .map(|(saved, live)| format!("saved {saved:?}, live {live:?}"))
                .unwrap_or_else(|| {
                    format!(
                        "saved {} parameters, live {}",
                        index.parameters.len(),
                        expected.len()
                    )
                });
            return Err(MeshError::CheckpointMismatch(diff));
        }

        let mut files: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        for &device in self.mesh.local_device_ids() {
            let file = index.devices.get(&device).ok_or_else(|| {
                MeshError::CheckpointMismatch(format!("no shard file for device {device}"))
            })?;
            if !files.contains_key(file.as_str()) {
                files.insert(file.as_str(), store.get(&join_key(&base, file))?);
            }
        }
        let parsed = files
            .iter()
            .map(|(name, bytes)| Ok((*name, SafeTensors::deserialize(bytes)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mut staged: Vec<Vec<Vec<f32>>> = Vec::new();
        for param in root.trainable_parameters() {
            let local_shape = param.local_shape();
            let mut shards = Vec::new();
            for (device, _) in param.local_shards() {
                let key = tensor_key(param.name(), device);
                let file = index.devices.get(&device).map(String::as_str).unwrap_or_default();
                let view = parsed
                    .get(file)
                    .ok_or_else(|| MeshError::CheckpointMismatch(format!("missing shard file {file}")))?
                    .tensor(&key)?;
                if view.dtype() != Dtype::F32 || view.shape() != local_shape.as_slice() {
                    return Err(MeshError::CheckpointMismatch(format!(
                        "{key} is {:?} {:?}, expected F32 {local_shape:?}",
                        view.dtype(),
                        view.shape()
                    )));
                }
                shards.push(
                    view.data()
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                );
            }
            staged.push(shards);
        }
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(shard_file(1, 2), "shard-00001-of-00002.safetensors");
        assert_eq!(tensor_key("classifier/kernel", 3), "classifier/kernel@3");
    }
}
