//! Max pooling with a square window equal to its stride (no padding)

use rayon::prelude::*;

use super::check_len;
use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Window edge and stride.
    pub window: usize,
}

impl PoolGeometry {
    pub fn output_height(&self) -> usize {
        self.height / self.window
    }

    pub fn output_width(&self) -> usize {
        self.width / self.window
    }

    pub fn input_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn output_len(&self) -> usize {
        self.channels * self.output_height() * self.output_width()
    }
}

/// Max over each window. `argmax` receives, per output element, the index of the
/// winning element inside its input sample. The first maximum in row-major window
/// order wins ties.
pub fn max_pool_forward(
    geom: &PoolGeometry,
    batch_size: usize,
    input: &[f32],
    output: &mut [f32],
    argmax: &mut [u32],
) -> Result<(), KernelError> {
    check_len("input", batch_size * geom.input_len(), input.len())?;
    check_len("output", batch_size * geom.output_len(), output.len())?;
    check_len("argmax", batch_size * geom.output_len(), argmax.len())?;

    let out_h = geom.output_height();
    let out_w = geom.output_width();
    let in_spatial = geom.height * geom.width;

    output
        .par_chunks_mut(geom.output_len())
        .zip(argmax.par_chunks_mut(geom.output_len()))
        .zip(input.par_chunks(geom.input_len()))
        .for_each(|((out, idx), inp)| {
            for c in 0..geom.channels {
                let in_base = c * in_spatial;
                let out_base = c * out_h * out_w;
                for py in 0..out_h {
                    for px in 0..out_w {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = in_base + py * geom.window * geom.width + px * geom.window;
                        for dy in 0..geom.window {
                            for dx in 0..geom.window {
                                let i = in_base
                                    + (py * geom.window + dy) * geom.width
                                    + px * geom.window
                                    + dx;
                                if inp[i] > best {
                                    best = inp[i];
                                    best_idx = i;
                                }
                            }
                        }
                        let o = out_base + py * out_w + px;
                        out[o] = best;
                        idx[o] = best_idx as u32;
                    }
                }
            }
        });
    Ok(())
}

/// Route each output gradient to the input element recorded in `argmax`.
/// Every other input element gets zero. `grad_input` is overwritten.
pub fn max_pool_backward(
    geom: &PoolGeometry,
    batch_size: usize,
    argmax: &[u32],
    grad_output: &[f32],
    grad_input: &mut [f32],
) -> Result<(), KernelError> {
    check_len("argmax", batch_size * geom.output_len(), argmax.len())?;
    check_len("output_gradient", batch_size * geom.output_len(), grad_output.len())?;
    check_len("input_gradient", batch_size * geom.input_len(), grad_input.len())?;

    grad_input
        .par_chunks_mut(geom.input_len())
        .zip(grad_output.par_chunks(geom.output_len()))
        .zip(argmax.par_chunks(geom.output_len()))
        .for_each(|((g_in, g_out), idx)| {
            g_in.iter_mut().for_each(|v| *v = 0.0);
            for (g, &i) in g_out.iter().zip(idx) {
                g_in[i as usize] += g;
            }
        });
    Ok(())
}
