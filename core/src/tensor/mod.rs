//! Dense host tensors.
//!
//! A [`Tensor`] is a flat row-major buffer plus a shape whose rank is fixed at compile time.
//! Every distributed tensor in this crate is ultimately a set of these, one per device,
//! so the operations here are the ones the sharding layer and the training step need:
//! block extraction and insertion, matrix products, and element-wise arithmetic.
//!
//! ```rust
//! use meshtrain::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! let right = t.block(&[0..2, 1..3]).unwrap();
//! assert_eq!(right.shape(), &[2, 2]);
//! assert_eq!(right.data(), &[2.0, 3.0, 5.0, 6.0]);
//! ```
//!
//! Layout is row-major: the last dimension changes fastest in memory.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use std::ops::Range;
use thiserror::Error;

pub mod bytes;
pub mod device;
pub mod ops;
pub mod storage;

pub use bytes::ElemBytes;
pub use device::{Cpu, Device};
pub use ops::TensorOps;
pub use storage::Storage;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index or block is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

impl From<meshtrain_kernels::KernelError> for TensorError {
    fn from(err: meshtrain_kernels::KernelError) -> Self {
        match err {
            meshtrain_kernels::KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            meshtrain_kernels::KernelError::BlockOutOfBounds { block, shape } => {
                TensorError::IndexOutOfBounds {
                    index: block.into_iter().flat_map(|(s, e)| [s, e]).collect(),
                    shape,
                }
            }
        }
    }
}

/// Trait bound for elements that can be stored in a Tensor.
///
/// - `Copy`: elements live in contiguous `Vec<T>` storage.
/// - `Num + ...`: numeric operations for the kernels.
/// - `Send + Sync`: parallel execution via `rayon`.
/// - `ElemBytes`: exact transfer between clients.
pub trait TensorElem:
    Num
    + NumAssign
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + FromPrimitive
    + ToPrimitive
    + PartialOrd
    + ElemBytes
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
        + ElemBytes
{
}

/// An N-dimensional array with a compile-time rank.
///
/// - `T`: element type.
/// - `RANK`: number of dimensions.
/// - `D`: where the data lives (defaults to [`Cpu`]).
///
/// Shapes are runtime values so batch sizes and shard extents can vary without
/// re-instantiating models; only the rank is checked by the compiler.
#[derive(Clone)]
pub struct Tensor<T, const RANK: usize, D: Device = Cpu>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: D::Storage<T>,
    device: D,
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        let strides = compute_strides(&shape);
        Ok(Self {
            shape,
            strides,
            data,
            device: Cpu,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![T::zero(); size],
            device: Cpu,
        }
    }

    /// Creates a new Tensor where every element is `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
            device: Cpu,
        }
    }

    /// Reshapes the tensor to a new shape with the same number of elements.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK, Cpu>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
            device: self.device,
        })
    }

    /// Consumes the tensor and returns its flat row-major buffer.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Copies out the sub-tensor covered by one half-open range per axis.
    ///
    /// This is the primitive behind sharding: a device's component of a distributed
    /// tensor is exactly one block of the global tensor.
    pub fn block(&self, ranges: &[Range<usize>; RANK]) -> Result<Self> {
        let data = meshtrain_kernels::cpu_extract_block(&self.data, &self.shape, ranges)?;
        let shape = std::array::from_fn(|axis| ranges[axis].len());
        Tensor::new(data, shape)
    }

    /// Writes `src` into the block covered by `ranges`. Inverse of [`Tensor::block`].
    pub fn set_block(&mut self, ranges: &[Range<usize>; RANK], src: &Self) -> Result<()> {
        let expected: [usize; RANK] = std::array::from_fn(|axis| ranges[axis].len());
        if src.shape != expected {
            return Err(TensorError::ShapeMismatch {
                expected: expected.to_vec(),
                got: src.shape.to_vec(),
            });
        }
        meshtrain_kernels::cpu_insert_block(&mut self.data, &self.shape, ranges, &src.data)?;
        Ok(())
    }

    /// Splits axis 0 into `parts` equal slices.
    pub fn split_rows(&self, parts: usize) -> Result<Vec<Self>> {
        let rows = self.shape.first().copied().unwrap_or(0);
        if RANK == 0 || parts == 0 || rows % parts != 0 {
            return Err(TensorError::Unsupported(format!(
                "cannot split {rows} rows into {parts} equal parts"
            )));
        }
        let step = rows / parts;
        (0..parts)
            .map(|p| {
                let ranges = std::array::from_fn(|axis| {
                    if axis == 0 {
                        p * step..(p + 1) * step
                    } else {
                        0..self.shape[axis]
                    }
                });
                self.block(&ranges)
            })
            .collect()
    }

    /// Concatenates tensors along axis 0. All other axes must agree.
    pub fn concat_rows(parts: &[Self]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::Unsupported("concat of zero tensors".into()))?;
        let mut shape = first.shape;
        let mut data = Vec::new();
        let mut rows = 0;
        for part in parts {
            if part.shape[1..] != first.shape[1..] {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: part.shape.to_vec(),
                });
            }
            rows += part.shape[0];
            data.extend_from_slice(&part.data);
        }
        shape[0] = rows;
        Tensor::new(data, shape)
    }
}

/// Row-major strides for `shape`.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize, D: Device> Tensor<T, RANK, D>
where
    T: TensorElem,
{
    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        self.data.as_slice()
    }

    /// Returns the underlying data as a mutable slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Returns the total number of elements in the tensor.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }
}

impl<T, const RANK: usize, D: Device> Debug for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device.name())
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl<T, const RANK: usize> PartialEq for Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}
