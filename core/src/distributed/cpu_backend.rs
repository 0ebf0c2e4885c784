use super::backend::CollectiveBackend;
use crate::error::{MeshError, Result};
use crate::tensor::{Tensor, TensorElem, TensorError};
use crossbeam::channel::{Receiver, Sender};

/// Collective backend over a ring of `crossbeam` channels.
///
/// Each rank receives from `rank - 1` and sends to `rank + 1`. All-reduce is the classic
/// ring algorithm (scatter-reduce, then all-gather of the reduced chunks); all-gather passes
/// every payload `world_size - 1` hops around the ring.
///
/// Dropping a backend closes its channel ends, so a neighbour blocked in a collective sees
/// [`MeshError::Collective`] instead of waiting forever.
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<u8>>,
    right_tx: Sender<Vec<u8>>,
}

impl CpuBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<u8>>,
        right_tx: Sender<Vec<u8>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    /// Builds a connected ring of `world_size` backends, one per rank.
    pub fn ring(world_size: usize) -> Vec<CpuBackend> {
        // Channel i carries rank i -> rank i + 1.
        let (txs, mut rxs): (Vec<_>, Vec<_>) = (0..world_size)
            .map(|_| crossbeam::channel::unbounded())
            .unzip();
        rxs.rotate_right(1);
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (right_tx, left_rx))| CpuBackend::new(rank, world_size, left_rx, right_tx))
            .collect()
    }

    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.right_tx.send(bytes).map_err(|_| {
            MeshError::Collective(format!(
                "rank {}: right neighbour {} disconnected",
                self.rank,
                (self.rank + 1) % self.world_size
            ))
        })
    }

    fn recv(&self) -> Result<Vec<u8>> {
        self.left_rx.recv().map_err(|_| {
            MeshError::Collective(format!(
                "rank {}: left neighbour {} disconnected",
                self.rank,
                (self.rank + self.world_size - 1) % self.world_size
            ))
        })
    }

    /// Index of the chunk handled at `step` with an extra `offset`, modulo the ring size.
    fn ring_index(&self, step: usize, offset: isize) -> usize {
        (self.rank as isize - step as isize + offset).rem_euclid(self.world_size as isize) as usize
    }
}

fn encode_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect()
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        let mut data = tensor
            .data()
            .iter()
            .map(|v| v.to_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| TensorError::Unsupported("element is not representable as f64".into()))?;
        let total = data.len();
        let chunk_size = total.div_ceil(self.world_size.max(1));
        let chunk = |idx: usize| {
            let start = (idx * chunk_size).min(total);
            start..(start + chunk_size).min(total)
        };

        // Scatter-reduce: after world_size - 1 steps rank r holds the full sum of chunk r + 1.
        for step in 0..self.world_size.saturating_sub(1) {
            self.send(encode_f64(&data[chunk(self.ring_index(step, 0))]))?;
            let received = decode_f64(&self.recv()?);
            for (slot, value) in data[chunk(self.ring_index(step, -1))]
                .iter_mut()
                .zip(received)
            {
                *slot += value;
            }
        }

        // All-gather of the reduced chunks.
        for step in 0..self.world_size.saturating_sub(1) {
            self.send(encode_f64(&data[chunk(self.ring_index(step, 1))]))?;
            let received = decode_f64(&self.recv()?);
            for (slot, value) in data[chunk(self.ring_index(step, 0))]
                .iter_mut()
                .zip(received)
            {
                *slot = value;
            }
        }

        let out = data
            .into_iter()
            .map(T::from_f64)
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| TensorError::Unsupported("reduced value out of range".into()))?;
        Ok(Tensor::new(out, *tensor.shape())?)
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let mut slots = vec![Vec::new(); self.world_size];
        slots[self.rank] = payload;
        for step in 0..self.world_size.saturating_sub(1) {
            self.send(slots[self.ring_index(step, 0)].clone())?;
            slots[self.ring_index(step, -1)] = self.recv()?;
        }
        Ok(slots)
    }
}
