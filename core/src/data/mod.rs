//! Input pipeline.
//!
//! Each client generates its own slice of a synthetic dataset, batches it, and packs every
//! batch into a batch-sharded [`DTensor`](crate::dtensor::DTensor).
//!
//! # Components
//!
//! - **Dataset**: indexed access to examples.
//! - **Sampler**: the order in which a loader visits a dataset.
//! - **DataLoader**: batches and collates examples, optionally repeating forever.
//! - **Pipeline params**: which input pipeline this client runs, agreed on by consensus.
//! - **ShardingPacker**: splits a client-local batch over the local batch replicas.

pub mod loader;
pub mod packer;
pub mod pipeline;
pub mod sampler;
pub mod synthetic;

pub use loader::{Collate, DataLoader, DefaultCollate};
pub use packer::{ShardedBatch, ShardingPacker};
pub use pipeline::{PipelineParams, derive_partition};
pub use sampler::{RandomSampler, Sampler, SequentialSampler};
pub use synthetic::{Batch, BatchCollate, Example, SyntheticConfig, SyntheticDataset};

/// Indexed access to a collection of examples.
pub trait Dataset<T>: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the item at `index`.
    ///
    /// # Panics
    ///
    /// May panic if `index` is out of bounds.
    fn get(&self, index: usize) -> T;
}

impl<T: Clone + Send + Sync> Dataset<T> for Vec<T> {
    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> T {
        self[index].clone()
    }
}
