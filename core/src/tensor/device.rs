//! Device abstraction for Tensor storage.
//!
//! A [`Device`] decides where tensor data lives and supplies the kernels that depend on the
//! memory it owns. Mesh devices (`/job:worker/.../device:CPU:3`) are a different concept: they
//! are coordinates in a [`Mesh`](crate::mesh::Mesh), each of which is backed by a host
//! [`Cpu`] tensor in this crate.

use crate::tensor::{Storage, TensorElem};
use std::fmt::Debug;

/// Where a tensor's data is stored and how device-specific kernels run.
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The type of storage used by this device.
    type Storage<T>: Storage<T>
    where
        T: TensorElem;

    /// Returns the name of the device.
    ///
    /// ```rust
    /// use meshtrain::tensor::{Cpu, Device};
    /// assert_eq!(Cpu.name(), "CPU");
    /// ```
    fn name(&self) -> &'static str;

    /// Swaps the last two axes of `data`.
    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>>;
}

/// Host memory, parallelised with `rayon`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cpu;

impl Device for Cpu {
    type Storage<T>
        = Vec<T>
    where
        T: TensorElem;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>> {
        if RANK < 2 {
            return Err(crate::tensor::TensorError::Unsupported(
                "Transpose requires rank >= 2".into(),
            ));
        }
        Ok(meshtrain_kernels::cpu_transpose(data, shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device_name() {
        assert_eq!(Cpu.name(), "CPU");
        assert_eq!(format!("{:?}", Cpu), "Cpu");
    }

    #[test]
    fn test_cpu_transpose_rank_error() {
        let result = Cpu::transpose(&vec![1.0], &[1]);
        assert!(matches!(
            result,
            Err(crate::tensor::TensorError::Unsupported(_))
        ));
    }

    #[test]
    fn test_cpu_transpose_mismatch() {
        let result = Cpu::transpose(&vec![1.0, 2.0], &[2, 2]);
        assert!(matches!(
            result,
            Err(crate::tensor::TensorError::ShapeMismatch { .. })
        ));
    }
}
