//! Tensor arithmetic.
//!
//! Element-wise operators require identical shapes; the only broadcast supported is the
//! row-wise bias add used by dense layers ([`Tensor::add_row`]). Element-wise loops run on
//! `rayon`.
//!
//! ```rust
//! use meshtrain::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Cpu, Device, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait for `&Tensor` with strict shape checking.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK, Cpu>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK, Cpu>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_iter())
                    .zip(rhs.data.par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

/// Operations whose implementation depends on the device.
pub trait TensorOps<T: TensorElem, const RANK: usize> {
    type Device: Device;

    /// Swaps the last two axes.
    fn transpose(&self) -> Result<Tensor<T, RANK, Self::Device>>;
}

impl<T, const RANK: usize, D: Device> TensorOps<T, RANK> for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    type Device = D;

    fn transpose(&self) -> Result<Tensor<T, RANK, D>> {
        let data = D::transpose(&self.data, &self.shape)?;

        let mut shape = self.shape;
        if RANK >= 2 {
            shape.swap(RANK - 1, RANK - 2);
        }

        Ok(Tensor {
            shape,
            strides: crate::tensor::compute_strides(&shape),
            data,
            device: self.device.clone(),
        })
    }
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Applies `f` element-wise, producing a new tensor of the same shape.
    ///
    /// ```rust
    /// use meshtrain::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// assert_eq!(t.map(|x| x * x).data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Combines two same-shaped tensors element-wise with `f`.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter().zip(rhs.data.par_iter()))
            .for_each(|(o, (a, b))| *o = f(*a, *b));
        Ok(out)
    }

    /// Batched matrix multiplication over the last two axes.
    ///
    /// - `[M, K] x [K, N] -> [M, N]`
    /// - `[B, M, K] x [B, K, N] -> [B, M, N]`
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        let data = meshtrain_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;

        let mut shape = self.shape;
        shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(data, shape)
    }
}

impl<T> Tensor<T, 2, Cpu>
where
    T: TensorElem,
{
    /// Adds `bias` (shape `[N]`) to every row of an `[M, N]` tensor.
    pub fn add_row(&self, bias: &Tensor<T, 1, Cpu>) -> Result<Self> {
        let n = self.shape[1];
        if bias.shape[0] != n {
            return Err(TensorError::ShapeMismatch {
                expected: vec![n],
                got: bias.shape.to_vec(),
            });
        }
        let mut out = self.clone();
        if n == 0 {
            return Ok(out);
        }
        out.data.par_chunks_mut(n).for_each(|row| {
            for (o, &b) in row.iter_mut().zip(&bias.data) {
                *o += b;
            }
        });
        Ok(out)
    }

    /// Sums over rows: `[M, N] -> [N]`.
    pub fn sum_rows(&self) -> Tensor<T, 1, Cpu> {
        let n = self.shape[1];
        let mut out = vec![T::zero(); n];
        if n > 0 {
            for row in self.data.chunks(n) {
                for (o, &v) in out.iter_mut().zip(row) {
                    *o += v;
                }
            }
        }
        Tensor {
            shape: [n],
            strides: [1],
            data: out,
            device: Cpu,
        }
    }
}
