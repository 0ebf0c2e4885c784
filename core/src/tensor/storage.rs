//! Storage abstraction for Tensors.
//!
//! The storage holds the raw elements of a tensor, while [`Tensor`](super::Tensor) holds shape
//! and strides. Kernels only ever see storage as a contiguous slice.

use crate::tensor::TensorElem;
use std::fmt::Debug;

/// A contiguous container backing a tensor.
pub trait Storage<T>: Clone + Debug + Send + Sync {
    /// Returns the data as an immutable slice.
    fn as_slice(&self) -> &[T];

    /// Returns the data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Returns the number of elements in the storage.
    fn len(&self) -> usize;

    /// Returns `true` if the storage contains no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host memory.
impl<T: TensorElem> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
    fn len(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_storage() {
        let mut storage = vec![1.0, 2.0, 3.0];
        assert_eq!(Storage::len(&storage), 3);
        assert!(!Storage::is_empty(&storage));

        storage.as_mut_slice()[0] = 10.0;
        assert_eq!(storage.as_slice(), &[10.0, 2.0, 3.0]);
    }

    #[test]
    fn test_empty_storage() {
        let storage: Vec<f32> = vec![];
        assert!(Storage::is_empty(&storage));
    }
}
