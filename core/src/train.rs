//! The distributed training loop.
//!
//! A step evaluates the model on the batch replicas this client owns, sums loss and
//! gradients over all clients with a single all-reduce, divides by the global batch size and
//! applies the optimizer to every local shard. Every client ends the step with identical
//! parameter values on every replica. No step is ever retried.

use crate::data::{Batch, ShardedBatch, ShardingPacker};
use crate::distributed::{Client, CollectiveBackend};
use crate::error::{MeshError, Result};
use crate::loss::Loss;
use crate::mesh::run_on;
use crate::models::{Model, ModelInputs};
use crate::nn::Module;
use crate::optim::Optimizer;
use crate::tensor::{Tensor, TensorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub num_epochs: usize,
    pub steps_per_epoch: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            steps_per_epoch: 10,
        }
    }
}

fn owned_inputs(batch: &ShardedBatch) -> Result<(ModelInputs, Tensor<usize, 1>)> {
    let dim = batch.batch_dim.as_str();
    let seq = batch.word_ids.global_shape()[1];
    let inputs = match (
        batch.word_ids.owned_replicas(dim)?,
        batch.mask.owned_replicas(dim)?,
        batch.type_ids.owned_replicas(dim)?,
    ) {
        (Some(word_ids), Some(mask), Some(type_ids)) => ModelInputs {
            word_ids,
            mask,
            type_ids,
        },
        _ => ModelInputs::empty(seq),
    };
    let labels = batch.labels.owned_replicas(dim)?.unwrap_or_else(|| Tensor::zeros([0]));
    Ok((inputs, labels))
}

/// Runs one synchronized step and returns the mean loss over the global batch. Collective.
pub fn train_step<M, B>(
    client: &Client<B>,
    model: &mut M,
    batch: &ShardedBatch,
    loss: &dyn Loss,
    optimizer: &mut dyn Optimizer,
) -> Result<f32>
where
    M: Model,
    B: CollectiveBackend,
{
    if batch.labels.layout().mesh() != model.mesh() {
        return Err(MeshError::Layout(format!(
            "batch is laid out on {} but the model lives on {}",
            batch.labels.layout().mesh(),
            model.mesh()
        )));
    }
    let mesh = model.mesh().clone();
    run_on(&mesh, || {
        let (inputs, labels) = owned_inputs(batch)?;
        let (logits, tape) = model.forward(client, &inputs, true)?;
        let tape = tape.ok_or_else(|| {
            MeshError::Consistency("training forward pass recorded no tape".into())
        })?;
        let out = loss.sum_and_grad(&logits, &labels)?;
        let grads = model.backward(tape, &out.grad)?;

        let mut flat: Vec<f32> = grads.iter().flatten().copied().collect();
        flat.push(out.sum);
        let len = flat.len();
        let reduced = client.all_reduce_sum(&Tensor::new(flat, [len])?)?.into_data();

        let scale = 1.0 / batch.global_rows() as f32;
        let mean_loss = reduced.last().copied().unwrap_or(0.0) * scale;
        apply_gradients(model, &reduced, scale, optimizer)?;
        debug!(rows = inputs.rows(), mean_loss, "step done");
        Ok(mean_loss)
    })
}

/// Applies summed global gradients (laid out back to back in parameter order) to every local
/// shard.
fn apply_gradients<M: Module + ?Sized>(
    model: &mut M,
    reduced: &[f32],
    scale: f32,
    optimizer: &mut dyn Optimizer,
) -> Result<()> {
    let mut offset = 0;
    for (index, param) in model.trainable_parameters_mut().into_iter().enumerate() {
        let shape = param.global_shape();
        let len: usize = shape.iter().product();
        let grad = reduced.get(offset..offset + len).ok_or_else(|| {
            MeshError::Consistency(format!("gradient for `{}` is truncated", param.name()))
        })?;
        offset += len;

        let devices = param.layout().mesh().local_device_ids().to_vec();
        let num_local = devices.len();
        let blocks = devices
            .iter()
            .map(|&device| param.device_block(device))
            .collect::<Result<Vec<_>>>()?;
        for (shard_index, ((_, shard), block)) in
            param.local_shards_mut().into_iter().zip(&blocks).enumerate()
        {
            let mut block_grad = meshtrain_kernels::cpu_extract_block(grad, &shape, block)
                .map_err(TensorError::from)?;
            block_grad.iter_mut().for_each(|g| *g *= scale);
            optimizer.update(index * num_local + shard_index, shard, &block_grad)?;
        }
    }
    Ok(())
}

/// Logs every trainable parameter's layout from the leader.
pub fn log_parameter_layouts<M: Module + ?Sized, B: CollectiveBackend>(client: &Client<B>, model: &M) {
    if !client.is_leader() {
        return;
    }
    for param in model.trainable_parameters() {
        info!(
            "{} has layout spec: {:?}",
            param.name(),
            param.layout().sharding_specs()
        );
    }
}

/// Trains for `num_epochs × steps_per_epoch` steps and returns the mean loss of each epoch.
///
/// `batches` yields this client's local batches; every step packs one with `packer`. The
/// leader reports each epoch's loss. Collective.
#[allow(clippy::too_many_arguments)]
pub fn train_model<M, B, I>(
    client: &Client<B>,
    model: &mut M,
    optimizer: &mut dyn Optimizer,
    loss: &dyn Loss,
    packer: &ShardingPacker,
    batches: &mut I,
    global_batch_size: usize,
    options: TrainOptions,
) -> Result<Vec<f32>>
where
    M: Model,
    B: CollectiveBackend,
    I: Iterator<Item = Result<Batch>>,
{
    if client.is_leader() {
        info!("Training started...");
    }
    let mut losses = Vec::with_capacity(options.num_epochs);
    let mut steps = 0;
    for epoch in 0..options.num_epochs {
        let mut total = 0.0f32;
        for _ in 0..options.steps_per_epoch {
            let batch = batches
                .next()
                .ok_or(MeshError::InputExhausted { steps })??;
            let sharded = packer.pack_batch(&batch)?;
            if sharded.global_rows() != global_batch_size {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![global_batch_size],
                    got: vec![sharded.global_rows()],
                }
                .into());
            }
            total += train_step(client, model, &sharded, loss, optimizer)?;
            steps += 1;
        }
        let epoch_loss = total / options.steps_per_epoch.max(1) as f32;
        if client.is_leader() {
            info!("Epoch {epoch}: Loss: {epoch_loss}");
        }
        losses.push(epoch_loss);
    }
    Ok(losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtensor::{DTensor, Layout};
    use crate::mesh::{DeviceType, Mesh, MeshDescription, MeshDim};
    use crate::nn::{Parameter, ParameterTensor};
    use crate::optim::Sgd;

    struct Single(Parameter<1>);

    impl Module for Single {
        fn trainable_parameters(&self) -> Vec<&dyn ParameterTensor> {
            vec![&self.0]
        }

        fn trainable_parameters_mut(&mut self) -> Vec<&mut dyn ParameterTensor> {
            vec![&mut self.0]
        }
    }

    #[test]
    fn test_gradients_reach_matching_blocks() {
        let description = MeshDescription::new(vec![MeshDim::new("model", 2)], DeviceType::Cpu, 2);
        let mesh = Mesh::new(description, 0, 1).unwrap();
        let layout = Layout::new(&["model"], &mesh).unwrap();
        let value = DTensor::from_global(&Tensor::zeros([4]), layout).unwrap();
        let mut model = Single(Parameter::new("w", value));

        let mut sgd = Sgd::new(1.0);
        apply_gradients(&mut model, &[1.0, 2.0, 3.0, 4.0, 9.0], 0.5, &mut sgd).unwrap();

        let shards = model.0.value().unpack();
        assert_eq!(shards[0].data(), &[-0.5, -1.0]);
        assert_eq!(shards[1].data(), &[-1.5, -2.0]);
    }

    #[test]
    fn test_truncated_gradient_rejected() {
        let description = MeshDescription::new(vec![MeshDim::new("model", 1)], DeviceType::Cpu, 1);
        let mesh = Mesh::new(description, 0, 1).unwrap();
        let value = DTensor::from_global(&Tensor::zeros([4]), Layout::replicated(&mesh, 1)).unwrap();
        let mut model = Single(Parameter::new("w", value));
        let mut sgd = Sgd::new(1.0);
        assert!(matches!(
            apply_gradients(&mut model, &[1.0, 2.0], 1.0, &mut sgd),
            Err(MeshError::Consistency(_))
        ));
    }
}
