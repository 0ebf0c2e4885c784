//! DataLoader implementation.

use super::{Dataset, RandomSampler, Sampler, SequentialSampler};
use std::marker::PhantomData;
use std::sync::Arc;

/// Collates a list of items into a batch.
pub trait Collate<T> {
    /// The batched output; collators that can fail return a `Result` here.
    type Output;

    fn collate(batch: Vec<T>) -> Self::Output;
}

/// Returns the `Vec<T>` unchanged.
pub struct DefaultCollate;

impl<T> Collate<T> for DefaultCollate {
    type Output = Vec<T>;

    fn collate(batch: Vec<T>) -> Self::Output {
        batch
    }
}

/// Combines a dataset and a sampler into an iterator over batches.
///
/// With [`repeat`](Self::repeat) the loader starts a new pass as soon as the previous one is
/// exhausted, and batches run across pass boundaries, so every batch is full.
pub struct DataLoader<D, T, C = DefaultCollate>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    batch_size: usize,
    sampler: Arc<dyn Sampler>,
    drop_last: bool,
    repeat: bool,
    _marker: PhantomData<(T, C)>,
}

impl<D, T> DataLoader<D, T, DefaultCollate>
where
    D: Dataset<T> + 'static,
{
    pub fn new(dataset: D, batch_size: usize) -> Self {
        DataLoader::with_collate(dataset, batch_size)
    }
}

impl<D, T, C> DataLoader<D, T, C>
where
    D: Dataset<T> + 'static,
    C: Collate<T>,
{
    /// Creates a loader that collates with `C`.
    pub fn with_collate(dataset: D, batch_size: usize) -> Self {
        Self {
            dataset: Arc::new(dataset),
            batch_size,
            sampler: Arc::new(SequentialSampler),
            drop_last: false,
            repeat: false,
            _marker: PhantomData,
        }
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    /// Shuffles every pass with a [`RandomSampler`] seeded by `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.sampler = Arc::new(RandomSampler::new(seed));
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn iter(&self) -> DataLoaderIter<D, T, C> {
        let indices = self.sampler.sample(self.dataset.len());
        DataLoaderIter {
            dataset: self.dataset.clone(),
            sampler: self.sampler.clone(),
            indices,
            batch_size: self.batch_size,
            current_idx: 0,
            drop_last: self.drop_last,
            repeat: self.repeat,
            _marker: PhantomData,
        }
    }
}

impl<D, T, C> IntoIterator for DataLoader<D, T, C>
where
    D: Dataset<T> + 'static,
    C: Collate<T>,
{
    type Item = C::Output;
    type IntoIter = DataLoaderIter<D, T, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    sampler: Arc<dyn Sampler>,
    indices: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
    drop_last: bool,
    repeat: bool,
    _marker: PhantomData<(T, C)>,
}

impl<D, T, C> Iterator for DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch_size == 0 {
            return None;
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            if self.current_idx >= self.indices.len() {
                if !self.repeat || self.dataset.is_empty() {
                    break;
                }
                self.indices = self.sampler.sample(self.dataset.len());
                self.current_idx = 0;
            }
            batch.push(self.dataset.get(self.indices[self.current_idx]));
            self.current_idx += 1;
        }

        if batch.is_empty() || (self.drop_last && batch.len() < self.batch_size) {
            return None;
        }
        Some(C::collate(batch))
    }
}
