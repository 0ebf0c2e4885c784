//! Synthetic classification data.
//!
//! Each input pipeline draws its own examples from a generator seeded with the pipeline id,
//! so no two pipelines see the same data and each pipeline's stream depends on its id alone.

use super::Dataset;
use super::loader::Collate;
use crate::error::{MeshError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Examples generated per pipeline. Also the global batch size.
    pub batch_size: usize,
    pub sequence_length: usize,
    pub vocab_size: usize,
    pub num_classes: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            sequence_length: 10,
            vocab_size: 100,
            num_classes: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub word_ids: Vec<usize>,
    pub mask: Vec<usize>,
    pub type_ids: Vec<usize>,
    pub label: usize,
}

pub struct SyntheticDataset {
    config: SyntheticConfig,
    examples: Vec<Example>,
}

fn draw(rng: &mut StdRng, bound: usize, len: usize) -> Vec<usize> {
    (0..len).map(|_| rng.random_range(0..bound)).collect()
}

impl SyntheticDataset {
    /// Generates the examples of pipeline `partition_id`.
    ///
    /// Arrays are drawn whole and in order: word ids, then the mask, then type ids, then
    /// labels.
    pub fn generate(config: SyntheticConfig, partition_id: usize) -> Result<Self> {
        if config.vocab_size == 0 || config.num_classes == 0 {
            return Err(MeshError::Layout(format!(
                "synthetic data needs a non-empty vocabulary and label set, got {config:?}"
            )));
        }
        let SyntheticConfig {
            batch_size: n,
            sequence_length: seq,
            vocab_size,
            num_classes,
        } = config;
        let mut rng = StdRng::seed_from_u64(partition_id as u64);
        let word_ids = draw(&mut rng, vocab_size, n * seq);
        let mask = draw(&mut rng, num_classes, n * seq);
        let type_ids = draw(&mut rng, num_classes, n * seq);
        let labels = draw(&mut rng, num_classes, n);

        let row = |data: &[usize], i: usize| data[i * seq..(i + 1) * seq].to_vec();
        let examples = (0..n)
            .map(|i| Example {
                word_ids: row(&word_ids, i),
                mask: row(&mask, i),
                type_ids: row(&type_ids, i),
                label: labels[i],
            })
            .collect();
        Ok(Self { config, examples })
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }
}

impl Dataset<Example> for SyntheticDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Example {
        self.examples[index].clone()
    }
}

/// A client-local batch: `[rows, seq]` id tensors and `[rows]` labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub word_ids: Tensor<usize, 2>,
    pub mask: Tensor<usize, 2>,
    pub type_ids: Tensor<usize, 2>,
    pub labels: Tensor<usize, 1>,
}

impl Batch {
    pub fn rows(&self) -> usize {
        self.labels.shape()[0]
    }
}

pub struct BatchCollate;

impl Collate<Example> for BatchCollate {
    type Output = Result<Batch>;

    fn collate(batch: Vec<Example>) -> Self::Output {
        let rows = batch.len();
        let seq = batch.first().map_or(0, |e| e.word_ids.len());
        let mut word_ids = Vec::with_capacity(rows * seq);
        let mut mask = Vec::with_capacity(rows * seq);
        let mut type_ids = Vec::with_capacity(rows * seq);
        let mut labels = Vec::with_capacity(rows);
        for example in batch {
            word_ids.extend(example.word_ids);
            mask.extend(example.mask);
            type_ids.extend(example.type_ids);
            labels.push(example.label);
        }
        Ok(Batch {
            word_ids: Tensor::new(word_ids, [rows, seq])?,
            mask: Tensor::new(mask, [rows, seq])?,
            type_ids: Tensor::new(type_ids, [rows, seq])?,
            labels: Tensor::new(labels, [rows])?,
        })
    }
}
