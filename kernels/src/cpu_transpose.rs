use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Swaps the last two axes of a row-major tensor.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }

    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let mut out = vec![T::zero(); size];
    if m == 0 {
        return Ok(out);
    }

    // Output rows are columns of the input: row `i` of batch `b` is column `i % n`.
    out.par_chunks_mut(m).enumerate().for_each(|(i, out_row)| {
        let base = (i / n) * m * n;
        let col = i % n;
        for (r, o) in out_row.iter_mut().enumerate() {
            *o = data[base + r * n + col];
        }
    });

    Ok(out)
}
