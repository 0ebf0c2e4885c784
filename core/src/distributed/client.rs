use super::backend::CollectiveBackend;
use super::cpu_backend::CpuBackend;
use crate::error::Result;
use crate::mesh::{DeviceType, Mesh, MeshDim, create_distributed_mesh};
use crate::tensor::{Tensor, TensorElem};
use std::sync::OnceLock;

/// Name of the single dimension of the auxiliary client mesh.
pub const CLIENTS_DIM: &str = "clients";

/// One participant in a multi-client run.
///
/// Owns `num_local_devices` devices of one type and a transport to the other clients.
/// The auxiliary one-dimensional mesh spanning the clients (one device per client) is built
/// on first use by [`Client::client_mesh`] and cached until [`Client::reset_client_mesh`].
pub struct Client<B: CollectiveBackend = CpuBackend> {
    backend: B,
    device_type: DeviceType,
    num_local_devices: usize,
    client_mesh: OnceLock<Mesh>,
}

impl<B: CollectiveBackend> Client<B> {
    pub fn new(backend: B, device_type: DeviceType, num_local_devices: usize) -> Self {
        Self {
            backend,
            device_type,
            num_local_devices,
            client_mesh: OnceLock::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.backend.rank()
    }

    pub fn num_clients(&self) -> usize {
        self.backend.world_size()
    }

    /// Client 0 prints progress and writes checkpoint indices.
    pub fn is_leader(&self) -> bool {
        self.id() == 0
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn num_local_devices(&self) -> usize {
        self.num_local_devices
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        self.backend.all_reduce_sum(tensor)
    }

    pub fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.backend.all_gather_bytes(payload)
    }

    pub fn barrier(&self) -> Result<()> {
        self.backend.barrier()
    }

    /// The mesh with one device per client, built on first use.
    ///
    /// Building it is collective, so the first call must happen on every client in the same
    /// round. Later calls return the cached mesh without communicating.
    pub fn client_mesh(&self) -> Result<&Mesh> {
        if let Some(mesh) = self.client_mesh.get() {
            return Ok(mesh);
        }
        let mesh = create_distributed_mesh(
            self,
            &[MeshDim::new(CLIENTS_DIM, self.num_clients())],
            self.device_type,
            self.num_clients(),
        )?;
        Ok(self.client_mesh.get_or_init(|| mesh))
    }

    /// Drops the cached client mesh; the next [`Client::client_mesh`] call rebuilds it.
    pub fn reset_client_mesh(&mut self) {
        self.client_mesh.take();
    }

    pub fn has_client_mesh(&self) -> bool {
        self.client_mesh.get().is_some()
    }
}
