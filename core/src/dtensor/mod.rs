//! Distributed tensors.
//!
//! A [`DTensor`] is one logical tensor stored as one component per device of a mesh. This
//! client only holds the components of its own devices, in local device order; the
//! components of other clients exist only on those clients. The [`Layout`] decides which
//! block of the global tensor each device holds.
//!
//! Operations that need data from other clients ([`DTensor::to_global`],
//! [`DTensor::relayout`]) are collectives.

pub mod layout;
pub mod layout_map;

pub use layout::{Layout, Sharding, UNSHARDED};
pub use layout_map::{LayoutMap, UnmatchedPolicy};

use crate::distributed::{Client, CollectiveBackend};
use crate::error::{MeshError, Result};
use crate::tensor::bytes::decode_le;
use crate::tensor::{Tensor, TensorElem, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;

/// Header of one device's component on the wire. A client's frame is the JSON header
/// length as a little-endian u64, the JSON list of headers, then every component's elements
/// in little-endian, in header order.
#[derive(Serialize, Deserialize)]
struct ComponentHeader {
    device: usize,
    shape: Vec<usize>,
}

fn split_frame(peer: usize, frame: &[u8]) -> Result<(Vec<ComponentHeader>, &[u8])> {
    let truncated = || MeshError::Consistency(format!("client {peer} sent a truncated frame"));
    let (len, rest) = frame.split_first_chunk::<8>().ok_or_else(truncated)?;
    let len = usize::try_from(u64::from_le_bytes(*len)).map_err(|_| truncated())?;
    if rest.len() < len {
        return Err(truncated());
    }
    let (header, data) = rest.split_at(len);
    Ok((serde_json::from_slice(header)?, data))
}

/// A tensor split across the devices of a mesh.
#[derive(Clone, Debug)]
pub struct DTensor<T: TensorElem, const RANK: usize> {
    layout: Layout,
    global_shape: [usize; RANK],
    components: Vec<Tensor<T, RANK>>,
}

fn block_array<const RANK: usize>(block: Vec<Range<usize>>) -> Result<[Range<usize>; RANK]> {
    let len = block.len();
    block.try_into().map_err(|_| {
        MeshError::Layout(format!("block of rank {len} for a rank-{RANK} tensor"))
    })
}

impl<T: TensorElem, const RANK: usize> DTensor<T, RANK> {
    /// Assembles a distributed tensor from one component per local device.
    ///
    /// Components must all have the local shape implied by `layout`; the global shape is the
    /// component shape scaled by the number of shards on each axis.
    pub fn pack(components: Vec<Tensor<T, RANK>>, layout: Layout) -> Result<Self> {
        if layout.rank() != RANK {
            return Err(MeshError::Layout(format!(
                "cannot pack rank-{RANK} components with {layout}"
            )));
        }
        let expected = layout.mesh().num_local_devices();
        if components.len() != expected {
            return Err(MeshError::Layout(format!(
                "expected {expected} components (one per local device), got {}",
                components.len()
            )));
        }
        let local_shape = *components[0].shape();
        if let Some(odd) = components.iter().find(|c| *c.shape() != local_shape) {
            return Err(TensorError::ShapeMismatch {
                expected: local_shape.to_vec(),
                got: odd.shape().to_vec(),
            }
            .into());
        }
        let global_shape = std::array::from_fn(|axis| local_shape[axis] * layout.num_shards(axis));
        Ok(Self {
            layout,
            global_shape,
            components,
        })
    }

    /// Components in local device order.
    pub fn unpack(&self) -> &[Tensor<T, RANK>] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Tensor<T, RANK>> {
        self.components
    }

    pub fn components_mut(&mut self) -> &mut [Tensor<T, RANK>] {
        &mut self.components
    }

    /// Slices a tensor that every client holds in full into this client's components.
    pub fn from_global(tensor: &Tensor<T, RANK>, layout: Layout) -> Result<Self> {
        if layout.rank() != RANK {
            return Err(MeshError::Layout(format!(
                "cannot lay out a rank-{RANK} tensor with {layout}"
            )));
        }
        let components = layout
            .mesh()
            .local_device_ids()
            .iter()
            .map(|&device| {
                let block = block_array(layout.device_block(device, tensor.shape())?)?;
                Ok(tensor.block(&block)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            global_shape: *tensor.shape(),
            layout,
            components,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn global_shape(&self) -> &[usize; RANK] {
        &self.global_shape
    }

    /// Shape of each component.
    pub fn local_shape(&self) -> [usize; RANK] {
        std::array::from_fn(|axis| self.global_shape[axis] / self.layout.num_shards(axis))
    }

    /// Block of the global tensor held by global device `device`.
    pub fn device_block(&self, device: usize) -> Result<[Range<usize>; RANK]> {
        block_array(self.layout.device_block(device, &self.global_shape)?)
    }

    fn local_len(&self) -> usize {
        self.components.iter().map(|c| c.data().len()).sum()
    }

    /// Reassembles the global tensor on every client. Collective.
    pub fn to_global<B: CollectiveBackend>(&self, client: &Client<B>) -> Result<Tensor<T, RANK>> {
        let headers = self
            .layout
            .mesh()
            .local_device_ids()
            .iter()
            .zip(&self.components)
            .map(|(&device, component)| ComponentHeader {
                device,
                shape: component.shape().to_vec(),
            })
            .collect::<Vec<_>>();
        let header = serde_json::to_vec(&headers)?;
        let mut frame = Vec::with_capacity(8 + header.len() + self.local_len() * T::WIDTH);
        frame.extend_from_slice(&(header.len() as u64).to_le_bytes());
        frame.extend_from_slice(&header);
        for component in &self.components {
            for v in component.data() {
                v.write_le(&mut frame);
            }
        }

        let gathered = client.all_gather_bytes(frame)?;

        let mut global = Tensor::zeros(self.global_shape);
        let mut covered = BTreeSet::new();
        for (peer, frame) in gathered.iter().enumerate() {
            let (headers, mut data) = split_frame(peer, frame)?;
            for header in headers {
                let shape: [usize; RANK] = header.shape.as_slice().try_into().map_err(|_| {
                    MeshError::Consistency(format!(
                        "device {} sent a component of rank {}",
                        header.device,
                        header.shape.len()
                    ))
                })?;
                let len = shape.iter().product::<usize>() * T::WIDTH;
                if data.len() < len {
                    return Err(MeshError::Consistency(format!(
                        "client {peer} sent a truncated component for device {}",
                        header.device
                    )));
                }
                let (bytes, rest) = data.split_at(len);
                data = rest;
                let values = decode_le::<T>(bytes).ok_or_else(|| {
                    MeshError::Consistency(format!("client {peer} sent misaligned element bytes"))
                })?;
                let component = Tensor::new(values, shape)?;
                global.set_block(&self.device_block(header.device)?, &component)?;
                covered.insert(header.device);
            }
            if !data.is_empty() {
                return Err(MeshError::Consistency(format!(
                    "client {peer} sent {} trailing bytes",
                    data.len()
                )));
            }
        }

        let num_devices = self.layout.mesh().num_devices();
        if covered.len() != num_devices || covered.iter().any(|&d| d >= num_devices) {
            return Err(MeshError::Consistency(format!(
                "gathered components for {} of {num_devices} devices",
                covered.len()
            )));
        }
        Ok(global)
    }

    /// Changes the layout on the same mesh. Collective.
    pub fn relayout<B: CollectiveBackend>(&self, layout: Layout, client: &Client<B>) -> Result<Self> {
        if layout.mesh().description() != self.layout.mesh().description() {
            return Err(MeshError::Layout(format!(
                "relayout from {} to {layout} crosses meshes",
                self.layout
            )));
        }
        let global = self.to_global(client)?;
        Self::from_global(&global, layout)
    }

    /// Rows of the batch replicas this client owns, concatenated in coordinate order.
    ///
    /// A replica (one coordinate along `dim`) is owned by the client hosting the lowest global
    /// device with that coordinate, so summing per-client results over all clients counts each
    /// replica exactly once. Returns `None` when this client owns no replica.
    pub fn owned_replicas(&self, dim: &str) -> Result<Option<Tensor<T, RANK>>> {
        if self.layout.specs().first() != Some(&Sharding::Dim(dim.to_string())) {
            return Err(MeshError::Layout(format!(
                "{} is not sharded over `{dim}` on axis 0",
                self.layout
            )));
        }
        let mesh = self.layout.mesh();
        let mut owned: Vec<(usize, Tensor<T, RANK>)> = Vec::new();
        for (&device, component) in mesh.local_device_ids().iter().zip(&self.components) {
            let coord = mesh.coordinate(device, dim)?;
            if owned.iter().any(|(c, _)| *c == coord) {
                continue;
            }
            let first_device = (0..mesh.num_devices())
                .find(|&d| mesh.coordinate(d, dim).is_ok_and(|c| c == coord))
                .unwrap_or(device);
            if mesh.client_of(first_device) == mesh.client_id() {
                owned.push((coord, component.clone()));
            }
        }
        if owned.is_empty() {
            return Ok(None);
        }
        owned.sort_by_key(|(coord, _)| *coord);
        let parts: Vec<_> = owned.into_iter().map(|(_, t)| t).collect();
        Ok(Some(Tensor::concat_rows(&parts)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{DeviceType, Mesh, MeshDescription, MeshDim};

    fn mesh(client_id: usize, num_clients: usize) -> Mesh {
        let description = MeshDescription::new(
            vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)],
            DeviceType::Cpu,
            8,
        );
        Mesh::new(description, client_id, num_clients).unwrap()
    }

    #[test]
    fn test_from_global_and_pack_agree() {
        let mesh = mesh(0, 2);
        let global = Tensor::<f32, 2>::new((0..32).map(|v| v as f32).collect(), [4, 8]).unwrap();
        let layout = Layout::new(&[UNSHARDED, "model"], &mesh).unwrap();
        let dt = DTensor::from_global(&global, layout.clone()).unwrap();

        assert_eq!(dt.unpack().len(), 4);
        assert_eq!(dt.local_shape(), [4, 4]);
        // Device 1 is model coordinate 1: the right half.
        assert_eq!(dt.unpack()[1].data()[..4], [4.0, 5.0, 6.0, 7.0]);

        let repacked = DTensor::pack(dt.clone().into_components(), layout).unwrap();
        assert_eq!(repacked.global_shape(), &[4, 8]);
    }

    #[test]
    fn test_pack_rejects_bad_components() {
        let mesh = mesh(0, 2);
        let layout = Layout::replicated(&mesh, 1);
        let one = Tensor::<f32, 1>::zeros([2]);
        assert!(DTensor::pack(vec![one.clone()], layout.clone()).is_err());

        let mixed = vec![one.clone(), one.clone(), one, Tensor::zeros([3])];
        assert!(matches!(
            DTensor::pack(mixed, layout),
            Err(MeshError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn test_owned_replicas() {
        // Two clients per batch coordinate: 4 clients x 2 devices, batch=2, model=4.
        let description = MeshDescription::new(
            vec![MeshDim::new("batch", 2), MeshDim::new("model", 4)],
            DeviceType::Cpu,
            8,
        );
        let global = Tensor::<f32, 1>::new(vec![10.0, 20.0], [2]).unwrap();
        let owners: Vec<Option<Vec<f32>>> = (0..4)
            .map(|client| {
                let mesh = Mesh::new(description.clone(), client, 4).unwrap();
                let layout = Layout::batch_sharded(&mesh, "batch", 1).unwrap();
                DTensor::from_global(&global, layout)
                    .unwrap()
                    .owned_replicas("batch")
                    .unwrap()
                    .map(|t| t.data().to_vec())
            })
            .collect();
        assert_eq!(owners, vec![Some(vec![10.0]), None, Some(vec![20.0]), None]);
    }

    #[test]
    fn test_to_global_keeps_non_finite_values() {
        use crate::distributed::Cluster;
        use crate::mesh::create_distributed_mesh;

        let dims = [MeshDim::new("batch", 4), MeshDim::new("model", 2)];
        let globals = Cluster::cpu(2, 4)
            .run(|client| {
                let mesh = create_distributed_mesh(&client, &dims, DeviceType::Cpu, 8)?;
                let values = vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, -0.0, 1.5, 2.5, 3.5, 4.5];
                let global = Tensor::<f32, 2>::new(values, [4, 2])?;
                let sharded = DTensor::from_global(&global, Layout::new(&["batch", "model"], &mesh)?)?;
                Ok(sharded.to_global(&client)?.data().to_vec())
            })
            .unwrap();

        for data in globals {
            assert!(data[0].is_nan());
            assert_eq!(data[1], f32::INFINITY);
            assert_eq!(data[2], f32::NEG_INFINITY);
            assert!(data[3] == 0.0 && data[3].is_sign_negative());
            assert_eq!(data[4..], [1.5, 2.5, 3.5, 4.5]);
        }
    }
}
