use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU matrix multiplication over the last two axes.
///
/// Leading axes are batch axes and must match. Each output row is produced
/// independently (parallel over `batch * m` rows) with an `i-k-j` loop so both
/// operands are read sequentially.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 1];

    if k != rhs_shape[RANK - 2] || lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out = vec![T::zero(); batch * m * n];
    if n == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
        let b = row / m.max(1);
        let lhs_row = &lhs_data[row * k..row * k + k];
        let rhs_mat = &rhs_data[b * k * n..(b + 1) * k * n];
        for (p, &a) in lhs_row.iter().enumerate() {
            if a == T::zero() {
                continue;
            }
            let rhs_row = &rhs_mat[p * n..(p + 1) * n];
            for (o, &r) in out_row.iter_mut().zip(rhs_row) {
                *o += a * r;
            }
        }
    });

    Ok(out)
}
