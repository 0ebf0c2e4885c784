use crate::distributed::{Client, CollectiveBackend};
use crate::dtensor::{DTensor, Layout};
use crate::error::Result;
use crate::tensor::Tensor;
use std::fmt;
use std::ops::Range;

/// A named, trainable distributed tensor.
#[derive(Clone)]
pub struct Parameter<const RANK: usize> {
    name: String,
    value: DTensor<f32, RANK>,
}

impl<const RANK: usize> Parameter<RANK> {
    pub fn new(name: impl Into<String>, value: DTensor<f32, RANK>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn value(&self) -> &DTensor<f32, RANK> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut DTensor<f32, RANK> {
        &mut self.value
    }

    /// Materialises the full tensor on every client. Collective.
    pub fn gather<B: CollectiveBackend>(&self, client: &Client<B>) -> Result<Tensor<f32, RANK>> {
        self.value.to_global(client)
    }
}

impl<const RANK: usize> fmt::Debug for Parameter<RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("shape", self.value.global_shape())
            .field("layout", &self.value.layout().sharding_specs())
            .finish()
    }
}

/// Rank-erased view of a parameter, for code that walks every parameter of a model
/// (optimizers, checkpoints, logging).
pub trait ParameterTensor: Send + Sync {
    fn name(&self) -> &str;

    fn layout(&self) -> &Layout;

    fn global_shape(&self) -> Vec<usize>;

    /// Shape of each local shard.
    fn local_shape(&self) -> Vec<usize>;

    /// Block of the global tensor held by global device `device`.
    fn device_block(&self, device: usize) -> Result<Vec<Range<usize>>>;

    /// `(global device id, shard data)` for every local device.
    fn local_shards(&self) -> Vec<(usize, &[f32])>;

    fn local_shards_mut(&mut self) -> Vec<(usize, &mut [f32])>;

    fn num_elements(&self) -> usize {
        self.global_shape().iter().product()
    }
}

impl<const RANK: usize> ParameterTensor for Parameter<RANK> {
    fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self) -> &Layout {
        self.value.layout()
    }

    fn global_shape(&self) -> Vec<usize> {
        self.value.global_shape().to_vec()
    }

    fn local_shape(&self) -> Vec<usize> {
        self.value.local_shape().to_vec()
    }

    fn device_block(&self, device: usize) -> Result<Vec<Range<usize>>> {
        Ok(self.value.device_block(device)?.to_vec())
    }

    fn local_shards(&self) -> Vec<(usize, &[f32])> {
        let devices = self.value.layout().mesh().local_device_ids();
        devices
            .iter()
            .copied()
            .zip(self.value.unpack().iter().map(|c| c.data()))
            .collect()
    }

    fn local_shards_mut(&mut self) -> Vec<(usize, &mut [f32])> {
        let devices = self.value.layout().mesh().local_device_ids().to_vec();
        devices
            .into_iter()
            .zip(self.value.components_mut().iter_mut().map(|c| c.data_mut()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtensor::UNSHARDED;
    use crate::mesh::{DeviceType, Mesh, MeshDescription, MeshDim};

    #[test]
    fn test_rank_erased_view() {
        let description = MeshDescription::new(
            vec![MeshDim::new("batch", 2), MeshDim::new("model", 2)],
            DeviceType::Cpu,
            4,
        );
        let mesh = Mesh::new(description, 1, 2).unwrap();
        let layout = Layout::new(&[UNSHARDED, "model"], &mesh).unwrap();
        let global = Tensor::<f32, 2>::new((0..8).map(|v| v as f32).collect(), [2, 4]).unwrap();
        let mut param = Parameter::new("dense/kernel", DTensor::from_global(&global, layout).unwrap());

        let view: &mut dyn ParameterTensor = &mut param;
        assert_eq!(view.name(), "dense/kernel");
        assert_eq!(view.global_shape(), vec![2, 4]);
        assert_eq!(view.local_shape(), vec![2, 2]);
        assert_eq!(view.num_elements(), 8);

        let shards = view.local_shards();
        assert_eq!(shards[0], (2, &[0.0, 1.0, 4.0, 5.0][..]));
        assert_eq!(shards[1], (3, &[2.0, 3.0, 6.0, 7.0][..]));
        assert_eq!(view.device_block(3).unwrap(), vec![0..2, 2..4]);

        for (_, shard) in view.local_shards_mut() {
            shard.fill(1.0);
        }
        assert!(param.value().unpack().iter().all(|c| c.data() == [1.0; 4]));
    }
}
