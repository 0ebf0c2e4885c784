//! # meshtrain
//!
//! `meshtrain` trains models over a logical grid of devices spread across several
//! cooperating clients. Clients share no memory; they meet only in collective operations,
//! which every client calls in the same order.
//!
//! Everything runs on CPU: a client is a thread, its devices are virtual CPUs, and the
//! collective transport is a ring of channels. The layering is the same as for real
//! multi-process training.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: N-dimensional tensors and CPU arithmetic.
//! - [`distributed`]: clients, the collective backend and the multi-client launcher.
//! - [`mesh`]: device meshes, the mesh rendezvous and the ambient execution scope.
//! - [`dtensor`]: distributed tensors, layouts and layout maps.
//! - [`data`]: synthetic input pipelines, pipeline partitioning and batch sharding.
//! - [`nn`], [`models`]: parameters, layers and the BERT-style classifier.
//! - [`loss`], [`optim`], [`train`]: the synchronized training loop.
//! - [`checkpoint`]: distributed save and restore.
//! - [`config`]: run configuration.
//!
//! ## Example
//!
//! ```rust
//! use meshtrain::distributed::Cluster;
//! use meshtrain::mesh::{DeviceType, MeshDim, create_distributed_mesh};
//!
//! let sizes = Cluster::cpu(2, 4)
//!     .run(|client| {
//!         let mesh = create_distributed_mesh(
//!             &client,
//!             &[MeshDim::new("batch", 4), MeshDim::new("model", 2)],
//!             DeviceType::Cpu,
//!             8,
//!         )?;
//!         Ok(mesh.local_coordinates("batch")?)
//!     })
//!     .unwrap();
//! assert_eq!(sizes, vec![vec![0, 1], vec![2, 3]]);
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod dtensor;
pub mod error;
pub mod loss;
pub mod mesh;
pub mod models;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;

pub use dtensor::{DTensor, Layout, LayoutMap};
pub use error::{MeshError, Result};
pub use mesh::{Mesh, current_mesh, run_on};
pub use tensor::{Cpu, Device, Storage, Tensor, TensorElem, TensorError, TensorOps};
