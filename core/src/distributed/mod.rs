//! Clients and the collectives they cooperate through.
//!
//! A run is a set of [`Client`]s, each standing in for one process that owns a disjoint block
//! of devices. Clients share no memory. Everything they agree on (the mesh, the input
//! partitioning, gradients, checkpoint completion) goes through a [`CollectiveBackend`].
//!
//! - [`CpuBackend`]: ring all-reduce and all-gather over `crossbeam` channels.
//! - [`Cluster`]: starts one thread per client, wires the ring and collects results.
//! - [`all_distinct_values`]: the consensus primitive used to number input pipelines.
//!
//! ```rust
//! use meshtrain::distributed::Cluster;
//!
//! let sums = Cluster::cpu(2, 4)
//!     .run(|client| {
//!         let t = meshtrain::tensor::Tensor::<f32, 1>::new(vec![client.id() as f32 + 1.0], [1])?;
//!         Ok(client.all_reduce_sum(&t)?.data()[0])
//!     })
//!     .unwrap();
//! assert_eq!(sums, vec![3.0, 3.0]);
//! ```

pub mod backend;
pub mod client;
pub mod consensus;
pub mod cpu_backend;
pub mod launcher;

pub use backend::CollectiveBackend;
pub use client::{CLIENTS_DIM, Client};
pub use consensus::all_distinct_values;
pub use cpu_backend::CpuBackend;
pub use launcher::Cluster;
