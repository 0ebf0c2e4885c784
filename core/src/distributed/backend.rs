use crate::error::Result;
use crate::tensor::{Tensor, TensorElem};

/// Transport between clients.
///
/// Every method is a collective: it blocks until every rank has made the matching call.
/// Ranks must issue collectives in the same order; a mismatch is not detected and either
/// deadlocks or returns data belonging to a different call.
pub trait CollectiveBackend: Send + Sync {
    /// Rank of this client.
    fn rank(&self) -> usize;

    /// Number of clients.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `tensor` over all ranks. Accumulates in `f64`.
    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>>;

    /// Returns every rank's payload, indexed by rank.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<()> {
        self.all_gather_bytes(Vec::new()).map(|_| ())
    }
}
