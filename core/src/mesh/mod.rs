//! Logical device meshes.
//!
//! A [`Mesh`] is an immutable grid of `N` global devices with named dimensions, seen from one
//! client. Global device `d` sits at the row-major decomposition of `d` over the dimension
//! sizes, so every client derives the same coordinates without talking to anyone. Client `c`
//! owns the contiguous device block `[c * L, (c + 1) * L)` where `L = N / num_clients`.
//!
//! ```rust
//! use meshtrain::mesh::{DeviceType, Mesh, MeshDescription, MeshDim};
//!
//! let description = MeshDescription::new(
//!     vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)],
//!     DeviceType::Cpu,
//!     8,
//! );
//! // Second of two clients.
//! let mesh = Mesh::new(description, 1, 2).unwrap();
//! assert_eq!(mesh.local_device_ids(), &[4, 5, 6, 7]);
//! assert_eq!(mesh.coordinate(5, "batch").unwrap(), 2);
//! assert_eq!(mesh.coordinate(5, "model").unwrap(), 1);
//! ```

pub mod scope;

pub use scope::{current_mesh, run_on};

use crate::distributed::{Client, CollectiveBackend};
use crate::dtensor::UNSHARDED;
use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of accelerator a mesh is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Tpu,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Tpu => "TPU",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CPU" => Ok(DeviceType::Cpu),
            "GPU" => Ok(DeviceType::Gpu),
            "TPU" => Ok(DeviceType::Tpu),
            _ => Err(MeshError::Topology(format!(
                "unknown device type `{s}` (expected CPU, GPU or TPU)"
            ))),
        }
    }
}

/// One named mesh dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDim {
    pub name: String,
    pub size: usize,
}

impl MeshDim {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// The client-independent part of a mesh. Every client must build its mesh from an
/// identical description; the rendezvous in [`create_distributed_mesh`] checks this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDescription {
    pub dims: Vec<MeshDim>,
    pub device_type: DeviceType,
    pub num_devices: usize,
}

impl MeshDescription {
    pub fn new(dims: Vec<MeshDim>, device_type: DeviceType, num_devices: usize) -> Self {
        Self {
            dims,
            device_type,
            num_devices,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dims.is_empty() {
            return Err(MeshError::Topology("a mesh needs at least one dimension".into()));
        }
        let mut seen = HashSet::new();
        for dim in &self.dims {
            if dim.name.is_empty() || dim.name == UNSHARDED {
                return Err(MeshError::Topology(format!(
                    "invalid mesh dimension name `{}`",
                    dim.name
                )));
            }
            if !seen.insert(dim.name.as_str()) {
                return Err(MeshError::Topology(format!(
                    "mesh dimension `{}` appears more than once",
                    dim.name
                )));
            }
            if dim.size == 0 {
                return Err(MeshError::Topology(format!(
                    "mesh dimension `{}` has size 0",
                    dim.name
                )));
            }
        }
        let product: usize = self.dims.iter().map(|d| d.size).product();
        if product != self.num_devices {
            return Err(MeshError::Topology(format!(
                "mesh dimensions {} cover {product} devices but {} were declared",
                self.dims_string(),
                self.num_devices
            )));
        }
        Ok(())
    }

    fn dims_string(&self) -> String {
        let parts: Vec<String> = self
            .dims
            .iter()
            .map(|d| format!("{}={}", d.name, d.size))
            .collect();
        format!("[{}]", parts.join(", "))
    }
}

/// Coordinates of one device, one entry per mesh dimension in mesh order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLocation {
    pub device: usize,
    pub coords: Vec<(String, usize)>,
}

impl DeviceLocation {
    pub fn get(&self, dim: &str) -> Option<usize> {
        self.coords
            .iter()
            .find(|(name, _)| name == dim)
            .map(|&(_, c)| c)
    }
}

struct MeshInner {
    description: MeshDescription,
    strides: Vec<usize>,
    client_id: usize,
    num_clients: usize,
    local_device_ids: Vec<usize>,
}

/// A device mesh as seen by one client. Cheap to clone.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    /// Builds the local view of a mesh without any cross-client rendezvous.
    ///
    /// Use [`create_distributed_mesh`] in a multi-client run; this constructor is for single
    /// client tooling and tests.
    pub fn new(description: MeshDescription, client_id: usize, num_clients: usize) -> Result<Self> {
        description.validate()?;
        if num_clients == 0 || client_id >= num_clients {
            return Err(MeshError::Topology(format!(
                "client {client_id} is not part of a {num_clients}-client run"
            )));
        }
        if description.num_devices % num_clients != 0 {
            return Err(MeshError::Topology(format!(
                "{} devices cannot be split evenly across {num_clients} clients",
                description.num_devices
            )));
        }

        let per_client = description.num_devices / num_clients;
        let mut strides = vec![1; description.dims.len()];
        for axis in (0..strides.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * description.dims[axis + 1].size;
        }

        Ok(Self {
            inner: Arc::new(MeshInner {
                strides,
                client_id,
                num_clients,
                local_device_ids: (client_id * per_client..(client_id + 1) * per_client).collect(),
                description,
            }),
        })
    }

    pub fn description(&self) -> &MeshDescription {
        &self.inner.description
    }

    pub fn dims(&self) -> &[MeshDim] {
        &self.inner.description.dims
    }

    pub fn dim_names(&self) -> Vec<&str> {
        self.dims().iter().map(|d| d.name.as_str()).collect()
    }

    pub fn contains_dim(&self, name: &str) -> bool {
        self.dim_index(name).is_some()
    }

    fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims().iter().position(|d| d.name == name)
    }

    fn require_dim(&self, name: &str) -> Result<usize> {
        self.dim_index(name).ok_or_else(|| {
            MeshError::Layout(format!(
                "mesh {} has no dimension `{name}`",
                self.inner.description.dims_string()
            ))
        })
    }

    /// Size of the named dimension.
    pub fn dim_size(&self, name: &str) -> Result<usize> {
        Ok(self.dims()[self.require_dim(name)?].size)
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.description.device_type
    }

    /// Number of global devices.
    pub fn num_devices(&self) -> usize {
        self.inner.description.num_devices
    }

    pub fn num_local_devices(&self) -> usize {
        self.inner.local_device_ids.len()
    }

    /// Global ids of this client's devices, ascending.
    pub fn local_device_ids(&self) -> &[usize] {
        &self.inner.local_device_ids
    }

    pub fn client_id(&self) -> usize {
        self.inner.client_id
    }

    pub fn num_clients(&self) -> usize {
        self.inner.num_clients
    }

    /// The client that hosts global device `device`.
    pub fn client_of(&self, device: usize) -> usize {
        device / (self.num_devices() / self.num_clients())
    }

    /// Coordinate of `device` along every dimension.
    pub fn coordinates(&self, device: usize) -> Vec<usize> {
        self.dims()
            .iter()
            .zip(&self.inner.strides)
            .map(|(dim, stride)| (device / stride) % dim.size)
            .collect()
    }

    /// Coordinate of `device` along the named dimension.
    pub fn coordinate(&self, device: usize, dim: &str) -> Result<usize> {
        let axis = self.require_dim(dim)?;
        if device >= self.num_devices() {
            return Err(MeshError::Topology(format!(
                "device {device} is outside a mesh of {} devices",
                self.num_devices()
            )));
        }
        Ok((device / self.inner.strides[axis]) % self.dims()[axis].size)
    }

    /// Locations of this client's devices in local device order.
    pub fn local_device_locations(&self) -> Vec<DeviceLocation> {
        self.local_device_ids()
            .iter()
            .map(|&device| DeviceLocation {
                device,
                coords: self
                    .dims()
                    .iter()
                    .map(|d| d.name.clone())
                    .zip(self.coordinates(device))
                    .collect(),
            })
            .collect()
    }

    /// Distinct coordinates along `dim` among this client's devices, ascending.
    pub fn local_coordinates(&self, dim: &str) -> Result<Vec<usize>> {
        let mut coords = self
            .local_device_ids()
            .iter()
            .map(|&d| self.coordinate(d, dim))
            .collect::<Result<Vec<_>>>()?;
        coords.sort_unstable();
        coords.dedup();
        Ok(coords)
    }

    /// Fully qualified name of a global device.
    pub fn device_name(&self, device: usize) -> String {
        let per_client = self.num_devices() / self.num_clients();
        format!(
            "/job:worker/replica:0/task:{}/device:{}:{}",
            self.client_of(device),
            self.device_type(),
            device % per_client
        )
    }
}

impl PartialEq for Mesh {
    fn eq(&self, other: &Self) -> bool {
        self.inner.description == other.inner.description
            && self.inner.client_id == other.inner.client_id
            && self.inner.num_clients == other.inner.num_clients
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("dims", &self.inner.description.dims_string())
            .field("device_type", &self.device_type())
            .field("num_devices", &self.num_devices())
            .field("client", &self.client_id())
            .finish()
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}x{}",
            self.inner.description.dims_string(),
            self.num_devices(),
            self.device_type()
        )
    }
}

/// Builds a mesh spanning every client.
///
/// Collective: returns only after every client has called it, and fails on every client if
/// any two described different meshes.
pub fn create_distributed_mesh<B: CollectiveBackend>(
    client: &Client<B>,
    dims: &[MeshDim],
    device_type: DeviceType,
    num_devices: usize,
) -> Result<Mesh> {
    let description = MeshDescription::new(dims.to_vec(), device_type, num_devices);
    let mesh = Mesh::new(description, client.id(), client.num_clients())?;

    if device_type != client.device_type() {
        return Err(MeshError::Topology(format!(
            "client {} has no {device_type} devices (it hosts {})",
            client.id(),
            client.device_type()
        )));
    }
    if mesh.num_local_devices() > client.num_local_devices() {
        return Err(MeshError::Topology(format!(
            "mesh needs {} local devices per client but client {} has {}",
            mesh.num_local_devices(),
            client.id(),
            client.num_local_devices()
        )));
    }

    let ours = serde_json::to_vec(mesh.description())?;
    for (peer, theirs) in client.all_gather_bytes(ours)?.iter().enumerate() {
        let theirs: MeshDescription = serde_json::from_slice(theirs)?;
        if &theirs != mesh.description() {
            return Err(MeshError::Consistency(format!(
                "client {peer} built mesh {} but client {} built {}",
                theirs.dims_string(),
                client.id(),
                mesh.description().dims_string()
            )));
        }
    }

    tracing::debug!(mesh = %mesh, "mesh ready");
    Ok(mesh)
}
