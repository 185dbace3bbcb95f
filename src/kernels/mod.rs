//! Compute kernels
//!
//! Slice-level arithmetic for every layer: convolution, batch normalisation with
//! ReLU, max pooling, dense products and the softmax cross-entropy loss. Kernels
//! validate their operand lengths and return a [`KernelError`] instead of
//! panicking; layers attach the phase and layer name.
//!
//! Work is split across the rayon pool per sample or per channel. Each output
//! element is reduced by exactly one task in a fixed order, so results do not
//! depend on the number of threads.

pub mod conv;
pub mod dense;
pub mod fused;
pub mod loss;
pub mod norm;
pub mod pool;

use crate::error::KernelError;

/// Reject a buffer whose length differs from what the kernel needs.
pub(crate) fn check_len(
    tensor: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), KernelError> {
    if expected != actual {
        return Err(KernelError::ShapeMismatch {
            tensor,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Row-major GEMM: `c = alpha * op(a) * op(b) + beta * c`.
///
/// `op(a)` is `m x k`, `op(b)` is `k x n`, `c` is `m x n`. When `transpose_a` is set,
/// `a` is stored `k x m`; likewise `b` is stored `n x k` when `transpose_b` is set.
#[cfg(feature = "blas")]
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    transpose_a: bool,
    transpose_b: bool,
    alpha: f32,
    beta: f32,
) {
    use cblas::{sgemm, Layout, Transpose};

    let trans_a = if transpose_a {
        Transpose::Ordinary
    } else {
        Transpose::None
    };
    let trans_b = if transpose_b {
        Transpose::Ordinary
    } else {
        Transpose::None
    };

    // SAFETY: callers size every buffer from the same m/n/k they pass here.
    unsafe {
        sgemm(
            Layout::RowMajor,
            trans_a,
            trans_b,
            m as i32,
            n as i32,
            k as i32,
            alpha,
            a,
            lda as i32,
            b,
            ldb as i32,
            beta,
            c,
            ldc as i32,
        );
    }
}

/// Row-major GEMM: `c = alpha * op(a) * op(b) + beta * c`.
///
/// Portable fallback used when the `blas` feature is off. Rows of `c` are computed
/// in parallel; each element is a sequential dot product.
#[cfg(not(feature = "blas"))]
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    transpose_a: bool,
    transpose_b: bool,
    alpha: f32,
    beta: f32,
) {
    use rayon::prelude::*;

    c.par_chunks_mut(ldc)
        .take(m)
        .enumerate()
        .for_each(|(i, c_row)| {
            for (j, c_ij) in c_row.iter_mut().take(n).enumerate() {
                let mut sum = 0.0f32;
                for p in 0..k {
                    let a_ip = if transpose_a {
                        a[p * lda + i]
                    } else {
                        a[i * lda + p]
                    };
                    let b_pj = if transpose_b {
                        b[j * ldb + p]
                    } else {
                        b[p * ldb + j]
                    };
                    sum += a_ip * b_pj;
                }
                *c_ij = if beta == 0.0 {
                    alpha * sum
                } else {
                    alpha * sum + beta * *c_ij
                };
            }
        });
}
