//! A BERT-style sentence classifier.
//!
//! Token and segment embeddings are summed and mean-pooled over the positions the attention
//! mask keeps (any nonzero mask value). The pooled vector runs through `num_layers` residual
//! feed-forward blocks, a tanh pooler and a linear classifier.
//!
//! Parameter names follow the encoder layout, so a [`LayoutMap`] can address them:
//!
//! ```text
//! encoder/word_embeddings/embeddings            [vocab_size, hidden_size]
//! encoder/type_embeddings/embeddings            [type_vocab_size, hidden_size]
//! encoder/transformer/layer_{i}/intermediate/{kernel,bias}
//! encoder/transformer/layer_{i}/_output_dense/{kernel,bias}
//! encoder/pooler_transform/{kernel,bias}
//! classifier/{kernel,bias}
//! ```

use super::traits::{Model, ModelInputs, ensure_in_scope};
use crate::distributed::{Client, CollectiveBackend};
use crate::dtensor::{LayoutMap, UNSHARDED};
use crate::error::{MeshError, Result};
use crate::mesh::Mesh;
use crate::nn::{
    Activation, Dense, Embedding, Initializer, Module, Parameter, ParameterBuilder,
    ParameterTensor,
};
use crate::tensor::{Cpu, Tensor, TensorError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub type_vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
    pub num_classes: usize,
    /// Standard deviation of the truncated normal kernel initializer.
    pub initializer_range: f32,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: 100,
            type_vocab_size: 16,
            hidden_size: 64,
            intermediate_size: 256,
            num_layers: 2,
            num_classes: 2,
            initializer_range: 0.02,
        }
    }
}

impl BertConfig {
    fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("type_vocab_size", self.type_vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_classes", self.num_classes),
        ];
        match sizes.iter().find(|(_, size)| *size == 0) {
            Some((name, _)) => Err(MeshError::Layout(format!("model {name} must be positive"))),
            None => Ok(()),
        }
    }
}

/// Layout rules for the model dimension `model_dim`: the pooler is split by output column and
/// every block's `_output_dense` kernel by input row. Everything else stays replicated.
pub fn default_layout_map(mesh: &Mesh, model_dim: &str) -> Result<LayoutMap> {
    LayoutMap::new(mesh)
        .rule(r".*pooler_transform.kernel", &[UNSHARDED, model_dim])?
        .rule(r".*pooler_transform.bias", &[model_dim])?
        .rule(
            r".*transformer/layer.\d*._output_dense.kernel",
            &[model_dim, UNSHARDED],
        )?
        .rule(r".*transformer/layer.\d*._output_dense.bias", &[UNSHARDED])
}

struct TransformerBlock {
    intermediate_kernel: Parameter<2>,
    intermediate_bias: Parameter<1>,
    output_kernel: Parameter<2>,
    output_bias: Parameter<1>,
}

impl TransformerBlock {
    fn new(b: &mut ParameterBuilder<'_>, hidden: usize, inner: usize, init: Initializer) -> Result<Self> {
        let (intermediate_kernel, intermediate_bias) = b.scope("intermediate", |b| {
            Ok((
                b.parameter("kernel", [hidden, inner], init)?,
                b.parameter("bias", [inner], Initializer::Zeros)?,
            ))
        })?;
        let (output_kernel, output_bias) = b.scope("_output_dense", |b| {
            Ok((
                b.parameter("kernel", [inner, hidden], init)?,
                b.parameter("bias", [hidden], Initializer::Zeros)?,
            ))
        })?;
        Ok(Self {
            intermediate_kernel,
            intermediate_bias,
            output_kernel,
            output_bias,
        })
    }

    fn parameters(&self) -> [&dyn ParameterTensor; 4] {
        [
            &self.intermediate_kernel,
            &self.intermediate_bias,
            &self.output_kernel,
            &self.output_bias,
        ]
    }

    fn parameters_mut(&mut self) -> [&mut dyn ParameterTensor; 4] {
        [
            &mut self.intermediate_kernel,
            &mut self.intermediate_bias,
            &mut self.output_kernel,
            &mut self.output_bias,
        ]
    }
}

pub struct BertClassifier {
    config: BertConfig,
    mesh: Mesh,
    word_embeddings: Parameter<2>,
    type_embeddings: Parameter<2>,
    layers: Vec<TransformerBlock>,
    pooler_kernel: Parameter<2>,
    pooler_bias: Parameter<1>,
    classifier_kernel: Parameter<2>,
    classifier_bias: Parameter<1>,
}

/// Full parameter values for one step.
struct Weights {
    word: Embedding,
    types: Embedding,
    layers: Vec<(Dense, Dense)>,
    pooler: Dense,
    classifier: Dense,
}

/// Activations of a training forward pass.
pub struct BertTape {
    weights: Weights,
    inputs: ModelInputs,
    /// `[rows, seq]` pooling weight of every position.
    pool_weights: Vec<f32>,
    /// Input of every block, then the input of the pooler.
    hidden: Vec<Tensor<f32, 2, Cpu>>,
    /// Pre-activation of every block's intermediate layer.
    pre_activations: Vec<Tensor<f32, 2, Cpu>>,
    pooled: Tensor<f32, 2, Cpu>,
}

impl BertClassifier {
    /// Builds the model's parameters. Must run inside `run_on` for the layout map's mesh.
    pub fn new(config: BertConfig, builder: &mut ParameterBuilder<'_>) -> Result<Self> {
        config.validate()?;
        let mesh = builder.layout_map().mesh().clone();
        ensure_in_scope(&mesh)?;

        let init = Initializer::TruncatedNormal {
            stddev: config.initializer_range,
        };
        let hidden = config.hidden_size;
        let (word_embeddings, type_embeddings, layers, pooler_kernel, pooler_bias) =
            builder.scope("encoder", |b| {
                let word = b.scope("word_embeddings", |b| {
                    b.parameter("embeddings", [config.vocab_size, hidden], init)
                })?;
                let types = b.scope("type_embeddings", |b| {
                    b.parameter("embeddings", [config.type_vocab_size, hidden], init)
                })?;
                let layers = b.scope("transformer", |b| {
                    (0..config.num_layers)
                        .map(|i| {
                            b.scope(&format!("layer_{i}"), |b| {
                                TransformerBlock::new(b, hidden, config.intermediate_size, init)
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })?;
                let (kernel, bias) = b.scope("pooler_transform", |b| {
                    Ok((
                        b.parameter("kernel", [hidden, hidden], init)?,
                        b.parameter("bias", [hidden], Initializer::Zeros)?,
                    ))
                })?;
                Ok((word, types, layers, kernel, bias))
            })?;
        let (classifier_kernel, classifier_bias) = builder.scope("classifier", |b| {
            Ok((
                b.parameter("kernel", [hidden, config.num_classes], init)?,
                b.parameter("bias", [config.num_classes], Initializer::Zeros)?,
            ))
        })?;

        Ok(Self {
            config,
            mesh,
            word_embeddings,
            type_embeddings,
            layers,
            pooler_kernel,
            pooler_bias,
            classifier_kernel,
            classifier_bias,
        })
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    fn gather<B: CollectiveBackend>(&self, client: &Client<B>) -> Result<Weights> {
        let dense = |kernel: &Parameter<2>, bias: &Parameter<1>| -> Result<Dense> {
            Ok(Dense::new(kernel.gather(client)?, bias.gather(client)?)?)
        };
        Ok(Weights {
            word: Embedding::new(self.word_embeddings.gather(client)?),
            types: Embedding::new(self.type_embeddings.gather(client)?),
            layers: self
                .layers
                .iter()
                .map(|l| {
                    Ok((
                        dense(&l.intermediate_kernel, &l.intermediate_bias)?,
                        dense(&l.output_kernel, &l.output_bias)?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?,
            pooler: dense(&self.pooler_kernel, &self.pooler_bias)?,
            classifier: dense(&self.classifier_kernel, &self.classifier_bias)?,
        })
    }
}

fn pool_weights(mask: &Tensor<usize, 2, Cpu>) -> Vec<f32> {
    let seq = mask.shape()[1];
    let mut weights = Vec::with_capacity(mask.size());
    if seq == 0 {
        return weights;
    }
    for row in mask.data().chunks(seq) {
        let kept = row.iter().filter(|&&m| m != 0).count().max(1) as f32;
        weights.extend(row.iter().map(|&m| if m != 0 { 1.0 / kept } else { 0.0 }));
    }
    weights
}

impl Module for BertClassifier {
    fn trainable_parameters(&self) -> Vec<&dyn ParameterTensor> {
        let mut params: Vec<&dyn ParameterTensor> =
            vec![&self.word_embeddings, &self.type_embeddings];
        for layer in &self.layers {
            params.extend(layer.parameters());
        }
        params.push(&self.pooler_kernel);
        params.push(&self.pooler_bias);
        params.push(&self.classifier_kernel);
        params.push(&self.classifier_bias);
        params
    }

    fn trainable_parameters_mut(&mut self) -> Vec<&mut dyn ParameterTensor> {
        let mut params: Vec<&mut dyn ParameterTensor> =
            vec![&mut self.word_embeddings, &mut self.type_embeddings];
        for layer in &mut self.layers {
            params.extend(layer.parameters_mut());
        }
        params.push(&mut self.pooler_kernel);
        params.push(&mut self.pooler_bias);
        params.push(&mut self.classifier_kernel);
        params.push(&mut self.classifier_bias);
        params
    }
}

impl Model for BertClassifier {
    type Tape = BertTape;

    fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    fn forward<B: CollectiveBackend>(
        &self,
        client: &Client<B>,
        inputs: &ModelInputs,
        training: bool,
    ) -> Result<(Tensor<f32, 2, Cpu>, Option<BertTape>)> {
        ensure_in_scope(&self.mesh)?;
        let shape = *inputs.word_ids.shape();
        for other in [&inputs.mask, &inputs.type_ids] {
            if *other.shape() != shape {
                return Err(TensorError::ShapeMismatch {
                    expected: shape.to_vec(),
                    got: other.shape().to_vec(),
                }
                .into());
            }
        }
        let [rows, seq] = shape;
        let hidden = self.config.hidden_size;

        let weights = self.gather(client)?;
        let embedded = (&weights.word.forward(&inputs.word_ids)?
            + &weights.types.forward(&inputs.type_ids)?)?;

        let pool_weights = pool_weights(&inputs.mask);
        let mut pooled = vec![0.0f32; rows * hidden];
        for (position, &w) in pool_weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let row = position / seq;
            let src = &embedded.data()[position * hidden..(position + 1) * hidden];
            for (dst, &v) in pooled[row * hidden..(row + 1) * hidden].iter_mut().zip(src) {
                *dst += w * v;
            }
        }

        let mut h = Tensor::new(pooled, [rows, hidden])?;
        let mut hidden_states = Vec::with_capacity(weights.layers.len() + 1);
        let mut pre_activations = Vec::with_capacity(weights.layers.len());
        for (intermediate, output) in &weights.layers {
            let z = intermediate.forward(&h)?;
            let next = (&h + &output.forward(&Activation::relu(&z))?)?;
            hidden_states.push(h);
            pre_activations.push(z);
            h = next;
        }
        let pooled = Activation::tanh(&weights.pooler.forward(&h)?);
        hidden_states.push(h);
        let logits = weights.classifier.forward(&pooled)?;

        let tape = training.then(|| BertTape {
            weights,
            inputs: inputs.clone(),
            pool_weights,
            hidden: hidden_states,
            pre_activations,
            pooled,
        });
        Ok((logits, tape))
    }

    fn backward(&self, tape: BertTape, d_logits: &Tensor<f32, 2, Cpu>) -> Result<Vec<Vec<f32>>> {
        let BertTape {
            weights,
            inputs,
            pool_weights,
            mut hidden,
            pre_activations,
            pooled,
        } = tape;
        let hidden_size = self.config.hidden_size;
        let [rows, seq] = *inputs.word_ids.shape();

        let classifier = weights.classifier.backward(&pooled, d_logits)?;
        let d_pre_pooler = Activation::tanh_backward(&pooled, &classifier.input)?;
        let pooler_input = hidden.pop().ok_or_else(|| {
            MeshError::Consistency("tape is missing the pooler input".into())
        })?;
        let pooler = weights.pooler.backward(&pooler_input, &d_pre_pooler)?;

        let mut dh = pooler.input;
        let mut block_grads = Vec::with_capacity(weights.layers.len());
        for (((intermediate, output), h), z) in weights
            .layers
            .iter()
            .zip(&hidden)
            .zip(&pre_activations)
            .rev()
        {
            let out = output.backward(&Activation::relu(z), &dh)?;
            let dz = Activation::relu_backward(z, &out.input)?;
            let inner = intermediate.backward(h, &dz)?;
            dh = (&dh + &inner.input)?;
            block_grads.push((inner, out));
        }
        block_grads.reverse();

        let mut d_embedded = vec![0.0f32; rows * seq * hidden_size];
        for (position, &w) in pool_weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let row = position / seq;
            let src = &dh.data()[row * hidden_size..(row + 1) * hidden_size];
            let dst = &mut d_embedded[position * hidden_size..(position + 1) * hidden_size];
            for (d, &g) in dst.iter_mut().zip(src) {
                *d = w * g;
            }
        }
        let d_embedded = Tensor::new(d_embedded, [rows, seq, hidden_size])?;
        let d_word = weights.word.backward(&inputs.word_ids, &d_embedded)?;
        let d_type = weights.types.backward(&inputs.type_ids, &d_embedded)?;

        let mut grads = vec![d_word.into_data(), d_type.into_data()];
        for (inner, out) in block_grads {
            grads.push(inner.kernel.into_data());
            grads.push(inner.bias.into_data());
            grads.push(out.kernel.into_data());
            grads.push(out.bias.into_data());
        }
        grads.push(pooler.kernel.into_data());
        grads.push(pooler.bias.into_data());
        grads.push(classifier.kernel.into_data());
        grads.push(classifier.bias.into_data());
        Ok(grads)
    }
}
