//! 2D convolution kernels (stride 1, symmetric zero padding)
//!
//! Layouts: images are `[batch][channels][height][width]`, weights are
//! `[out_channels][in_channels][kernel][kernel]`.

use rayon::prelude::*;

use super::check_len;
use crate::error::KernelError;

/// Static shape of a stride-1 convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_size: usize,
    pub padding: usize,
}

impl ConvGeometry {
    /// `height + 2 * padding - kernel_size + 1`
    pub fn output_height(&self) -> usize {
        (self.height + 2 * self.padding + 1).saturating_sub(self.kernel_size)
    }

    /// `width + 2 * padding - kernel_size + 1`
    pub fn output_width(&self) -> usize {
        (self.width + 2 * self.padding + 1).saturating_sub(self.kernel_size)
    }

    /// Elements in one input sample.
    pub fn input_len(&self) -> usize {
        self.in_channels * self.height * self.width
    }

    /// Elements in one output sample.
    pub fn output_len(&self) -> usize {
        self.out_channels * self.output_height() * self.output_width()
    }

    pub fn weight_len(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_size * self.kernel_size
    }

    fn kernel_area(&self) -> usize {
        self.kernel_size * self.kernel_size
    }

    /// Input coordinate under kernel tap `(ky, kx)` for output `(oy, ox)`, if inside.
    #[inline]
    fn input_pos(&self, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy + ky).checked_sub(self.padding)?;
        let ix = (ox + kx).checked_sub(self.padding)?;
        if iy < self.height && ix < self.width {
            Some((iy, ix))
        } else {
            None
        }
    }
}

/// `output = conv(input, weights) + bias`, one task per sample.
pub fn conv2d_forward(
    geom: &ConvGeometry,
    batch_size: usize,
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    output: &mut [f32],
) -> Result<(), KernelError> {
    check_len("input", batch_size * geom.input_len(), input.len())?;
    check_len("weights", geom.weight_len(), weights.len())?;
    check_len("bias", geom.out_channels, bias.len())?;
    check_len("output", batch_size * geom.output_len(), output.len())?;

    output
        .par_chunks_mut(geom.output_len())
        .zip(input.par_chunks(geom.input_len()))
        .for_each(|(out, inp)| forward_sample(geom, inp, weights, bias, out));
    Ok(())
}

fn forward_sample(geom: &ConvGeometry, input: &[f32], weights: &[f32], bias: &[f32], out: &mut [f32]) {
    let out_h = geom.output_height();
    let out_w = geom.output_width();
    let in_spatial = geom.height * geom.width;
    let area = geom.kernel_area();

    for (oc, out_map) in out.chunks_exact_mut(out_h * out_w).enumerate() {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut sum = bias[oc];
                for ic in 0..geom.in_channels {
                    let w_base = (oc * geom.in_channels + ic) * area;
                    let in_base = ic * in_spatial;
                    for ky in 0..geom.kernel_size {
                        for kx in 0..geom.kernel_size {
                            if let Some((iy, ix)) = geom.input_pos(oy, ox, ky, kx) {
                                sum += input[in_base + iy * geom.width + ix]
                                    * weights[w_base + ky * geom.kernel_size + kx];
                            }
                        }
                    }
                }
                out_map[oy * out_w + ox] = sum;
            }
        }
    }
}

/// Gradient with respect to the input. `grad_input` is overwritten.
pub fn conv2d_backward_input(
    geom: &ConvGeometry,
    batch_size: usize,
    weights: &[f32],
    grad_output: &[f32],
    grad_input: &mut [f32],
) -> Result<(), KernelError> {
    check_len("weights", geom.weight_len(), weights.len())?;
    check_len("output_gradient", batch_size * geom.output_len(), grad_output.len())?;
    check_len("input_gradient", batch_size * geom.input_len(), grad_input.len())?;

    let out_h = geom.output_height();
    let out_w = geom.output_width();
    let in_spatial = geom.height * geom.width;
    let area = geom.kernel_area();

    grad_input
        .par_chunks_mut(geom.input_len())
        .zip(grad_output.par_chunks(geom.output_len()))
        .for_each(|(g_in, g_out)| {
            g_in.iter_mut().for_each(|v| *v = 0.0);
            for oc in 0..geom.out_channels {
                let g_map = &g_out[oc * out_h * out_w..(oc + 1) * out_h * out_w];
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let g = g_map[oy * out_w + ox];
                        if g == 0.0 {
                            continue;
                        }
                        for ic in 0..geom.in_channels {
                            let w_base = (oc * geom.in_channels + ic) * area;
                            for ky in 0..geom.kernel_size {
                                for kx in 0..geom.kernel_size {
                                    if let Some((iy, ix)) = geom.input_pos(oy, ox, ky, kx) {
                                        g_in[ic * in_spatial + iy * geom.width + ix] +=
                                            g * weights[w_base + ky * geom.kernel_size + kx];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    Ok(())
}

/// Weight and bias gradients summed over the batch, one task per output channel.
/// Both gradient buffers are overwritten.
pub fn conv2d_backward_params(
    geom: &ConvGeometry,
    batch_size: usize,
    input: &[f32],
    grad_output: &[f32],
    grad_weights: &mut [f32],
    grad_bias: &mut [f32],
) -> Result<(), KernelError> {
    check_len("input", batch_size * geom.input_len(), input.len())?;
    check_len("output_gradient", batch_size * geom.output_len(), grad_output.len())?;
    check_len("weight_gradient", geom.weight_len(), grad_weights.len())?;
    check_len("bias_gradient", geom.out_channels, grad_bias.len())?;

    let out_h = geom.output_height();
    let out_w = geom.output_width();
    let out_spatial = out_h * out_w;
    let in_spatial = geom.height * geom.width;
    let per_filter = geom.in_channels * geom.kernel_area();

    grad_weights
        .par_chunks_mut(per_filter)
        .zip(grad_bias.par_iter_mut())
        .enumerate()
        .for_each(|(oc, (g_w, g_b))| {
            g_w.iter_mut().for_each(|v| *v = 0.0);
            let mut bias_sum = 0.0f32;
            for b in 0..batch_size {
                let g_map = &grad_output[b * geom.output_len() + oc * out_spatial..][..out_spatial];
                let sample = &input[b * geom.input_len()..][..geom.input_len()];
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let g = g_map[oy * out_w + ox];
                        bias_sum += g;
                        if g == 0.0 {
                            continue;
                        }
                        for ic in 0..geom.in_channels {
                            let w_base = ic * geom.kernel_area();
                            for ky in 0..geom.kernel_size {
                                for kx in 0..geom.kernel_size {
                                    if let Some((iy, ix)) = geom.input_pos(oy, ox, ky, kx) {
                                        g_w[w_base + ky * geom.kernel_size + kx] +=
                                            g * sample[ic * in_spatial + iy * geom.width + ix];
                                    }
                                }
                            }
                        }
                    }
                }
            }
            *g_b = bias_sum;
        });
    Ok(())
}
