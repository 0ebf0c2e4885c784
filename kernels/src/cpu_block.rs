//! Strided block copies.
//!
//! A block is one half-open range per axis. Both kernels walk the block in row-major
//! order and copy the innermost axis as one contiguous run, so a block that spans full
//! rows degenerates into a handful of `copy_from_slice` calls.

use crate::{KernelElem, KernelError, Result};
use std::ops::Range;

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

fn check_block(shape: &[usize], block: &[Range<usize>]) -> Result<()> {
    let in_bounds = block.len() == shape.len()
        && block
            .iter()
            .zip(shape)
            .all(|(r, &dim)| r.start <= r.end && r.end <= dim);
    if in_bounds {
        Ok(())
    } else {
        Err(KernelError::BlockOutOfBounds {
            block: block.iter().map(|r| (r.start, r.end)).collect(),
            shape: shape.to_vec(),
        })
    }
}

/// Visits the flat offset of the first element of every innermost run in `block`.
fn for_each_run(shape: &[usize], block: &[Range<usize>], mut visit: impl FnMut(usize)) {
    let rank = shape.len();
    if rank == 0 {
        visit(0);
        return;
    }
    if block.iter().any(|r| r.is_empty()) {
        return;
    }
    let strides = row_major_strides(shape);
    let mut index: Vec<usize> = block[..rank - 1].iter().map(|r| r.start).collect();
    loop {
        let offset = index
            .iter()
            .zip(&strides)
            .map(|(i, s)| i * s)
            .sum::<usize>()
            + block[rank - 1].start;
        visit(offset);

        // Odometer increment over the outer axes.
        let mut axis = rank - 1;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < block[axis].end {
                break;
            }
            index[axis] = block[axis].start;
        }
    }
}

/// Copies `block` out of a row-major tensor of `shape`.
pub fn cpu_extract_block<T: KernelElem>(
    data: &[T],
    shape: &[usize],
    block: &[Range<usize>],
) -> Result<Vec<T>> {
    check_block(shape, block)?;
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(KernelError::ShapeMismatch {
            expected: vec![expected],
            got: vec![data.len()],
        });
    }
    let run = block.last().map_or(1, |r| r.len());
    let mut out = Vec::with_capacity(block.iter().map(|r| r.len()).product());
    for_each_run(shape, block, |offset| {
        out.extend_from_slice(&data[offset..offset + run]);
    });
    Ok(out)
}

/// Writes `src` (laid out as the block's own row-major shape) into `block` of `dst`.
pub fn cpu_insert_block<T: KernelElem>(
    dst: &mut [T],
    shape: &[usize],
    block: &[Range<usize>],
    src: &[T],
) -> Result<()> {
    check_block(shape, block)?;
    let block_len: usize = block.iter().map(|r| r.len()).product();
    if src.len() != block_len {
        return Err(KernelError::ShapeMismatch {
            expected: vec![block_len],
            got: vec![src.len()],
        });
    }
    let run = block.last().map_or(1, |r| r.len());
    let mut cursor = 0;
    for_each_run(shape, block, |offset| {
        dst[offset..offset + run].copy_from_slice(&src[cursor..cursor + run]);
        cursor += run;
    });
    Ok(())
}
