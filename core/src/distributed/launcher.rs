use super::client::Client;
use super::cpu_backend::CpuBackend;
use crate::error::{MeshError, Result};
use crate::mesh::DeviceType;
use tracing::info_span;

/// Runs one closure per client on its own thread, connected by a [`CpuBackend`] ring.
///
/// Each client thread runs inside an `info_span!("client", id)`. The client is moved into the
/// closure, so when a client returns early its channel ends close and peers blocked in a
/// collective fail instead of hanging.
#[derive(Clone, Debug)]
pub struct Cluster {
    num_clients: usize,
    device_type: DeviceType,
    devices_per_client: usize,
}

impl Cluster {
    pub fn new(num_clients: usize, device_type: DeviceType, devices_per_client: usize) -> Self {
        Self {
            num_clients,
            device_type,
            devices_per_client,
        }
    }

    /// `num_clients` clients with `devices_per_client` virtual CPUs each.
    pub fn cpu(num_clients: usize, devices_per_client: usize) -> Self {
        Self::new(num_clients, DeviceType::Cpu, devices_per_client)
    }

    pub fn num_clients(&self) -> usize {
        self.num_clients
    }

    /// Runs `f` on every client and returns the results in client order.
    ///
    /// If any client fails, returns the first failure that is not a transport error, falling
    /// back to the first transport error; peers of a failed client usually only see a
    /// disconnection. A panicking client re-raises its panic here.
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Client) -> Result<R> + Sync,
        R: Send,
    {
        if self.num_clients == 0 {
            return Err(MeshError::Topology("a run needs at least one client".into()));
        }

        let results: Vec<Result<R>> = std::thread::scope(|scope| {
            let spawned: Vec<_> = CpuBackend::ring(self.num_clients)
                .into_iter()
                .map(|backend| {
                    let client = Client::new(backend, self.device_type, self.devices_per_client);
                    let f = &f;
                    std::thread::Builder::new()
                        .name(format!("client-{}", client.id()))
                        .spawn_scoped(scope, move || {
                            let span = info_span!("client", id = client.id());
                            let _enter = span.enter();
                            f(client)
                        })
                })
                .collect();

            spawned
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                    Err(err) => Err(MeshError::Io(err)),
                })
                .collect()
        });

        let root_cause = results
            .iter()
            .position(|r| matches!(r, Err(e) if !matches!(e, MeshError::Collective(_))))
            .or_else(|| results.iter().position(|r| r.is_err()));
        if let Some(index) = root_cause {
            return match results.into_iter().nth(index) {
                Some(Err(err)) => Err(err),
                _ => Err(MeshError::Collective("client failed".into())),
            };
        }
        results.into_iter().collect()
    }
}
