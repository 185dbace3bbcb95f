//! Fused convolution + batch normalisation + ReLU
//!
//! The forward pass runs the convolution into a workspace buffer, normalises it
//! per output channel and applies ReLU. In training mode it also caches the
//! normalised activations and the batch `1 / std` the backward pass needs, and
//! blends the batch statistics into the moving statistics. In inference mode the
//! moving statistics are used as-is and the training cache is invalidated.

use super::conv::{conv2d_backward_input, conv2d_backward_params, conv2d_forward, ConvGeometry};
use super::norm::{
    batch_statistics, normalize_relu_backward, normalize_relu_forward, update_moving_statistics,
    NormAffine, NormBackward, NormGeometry,
};
use crate::error::{KernelError, Result};
use crate::layers::Mode;
use crate::tensor::{Shape, Tensor};

/// Shape and normalisation constants of the fused operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedGeometry {
    pub conv: ConvGeometry,
    pub momentum: f32,
    pub epsilon: f32,
}

impl FusedGeometry {
    pub fn norm(&self) -> NormGeometry {
        NormGeometry {
            channels: self.conv.out_channels,
            spatial: self.conv.output_height() * self.conv.output_width(),
        }
    }

    fn output_shape(&self) -> Shape {
        Shape::ImageChw {
            channels: self.conv.out_channels,
            height: self.conv.output_height(),
            width: self.conv.output_width(),
        }
    }
}

/// Trainable parameters, read-only during forward and backward.
pub struct FusedParameters<'a> {
    pub weights: &'a [f32],
    pub bias: &'a [f32],
    pub gamma: &'a [f32],
    pub beta: &'a [f32],
}

/// Moving mean and variance, updated only by a training-mode forward.
pub struct MovingStatistics<'a> {
    pub mean: &'a mut [f32],
    pub variance: &'a mut [f32],
}

/// Gradient outputs of the fused backward pass. Every buffer is overwritten.
pub struct FusedGradients<'a> {
    pub input: &'a mut [f32],
    pub weights: &'a mut [f32],
    pub bias: &'a mut [f32],
    pub gamma: &'a mut [f32],
    pub beta: &'a mut [f32],
}

/// Scratch buffers owned by the fused layer between forward and backward.
#[derive(Debug)]
pub struct FusedWorkspace {
    pre_norm: Tensor,
    normalized: Tensor,
    grad_pre_norm: Tensor,
    batch_mean: Vec<f32>,
    batch_variance: Vec<f32>,
    inv_std: Vec<f32>,
    /// Batch size of the last training-mode forward, if its cache is still valid.
    trained_batch: Option<usize>,
}

impl FusedWorkspace {
    pub fn new(geom: &FusedGeometry, max_batch: usize) -> Result<Self> {
        let shape = geom.output_shape();
        let channels = geom.conv.out_channels;
        Ok(Self {
            pre_norm: Tensor::zeros(shape, max_batch)?,
            normalized: Tensor::zeros(shape, max_batch)?,
            grad_pre_norm: Tensor::zeros(shape, max_batch)?,
            batch_mean: vec![0.0; channels],
            batch_variance: vec![0.0; channels],
            inv_std: vec![0.0; channels],
            trained_batch: None,
        })
    }

    /// Whether a training-mode forward has left state for a backward pass.
    pub fn has_training_state(&self) -> bool {
        self.trained_batch.is_some()
    }

    /// Statistics of the last training batch: `(mean, biased variance)`.
    pub fn batch_statistics(&self) -> (&[f32], &[f32]) {
        (&self.batch_mean, &self.batch_variance)
    }
}

/// Forward pass. `output` holds `batch_size` samples of the convolution output shape.
#[allow(clippy::too_many_arguments)]
pub fn conv_batch_norm_relu_forward(
    geom: &FusedGeometry,
    batch_size: usize,
    mode: Mode,
    input: &[f32],
    params: &FusedParameters<'_>,
    moving: MovingStatistics<'_>,
    workspace: &mut FusedWorkspace,
    output: &mut [f32],
) -> std::result::Result<(), KernelError> {
    workspace.trained_batch = None;

    let norm = geom.norm();
    let stride = geom.conv.output_len();
    let pre_norm = workspace
        .pre_norm
        .batch_view_mut("pre_norm", stride, batch_size)?;
    conv2d_forward(
        &geom.conv,
        batch_size,
        input,
        params.weights,
        params.bias,
        pre_norm,
    )?;
    let pre_norm = &*pre_norm;

    match mode {
        Mode::Training => {
            batch_statistics(
                &norm,
                batch_size,
                pre_norm,
                &mut workspace.batch_mean,
                &mut workspace.batch_variance,
            )?;
            let affine = NormAffine {
                mean: &workspace.batch_mean,
                variance: &workspace.batch_variance,
                gamma: params.gamma,
                beta: params.beta,
                epsilon: geom.epsilon,
            };
            let normalized = workspace
                .normalized
                .batch_view_mut("normalized", stride, batch_size)?;
            workspace.inv_std =
                normalize_relu_forward(&norm, batch_size, pre_norm, &affine, Some(normalized), output)?;
            update_moving_statistics(
                geom.momentum,
                &workspace.batch_mean,
                &workspace.batch_variance,
                moving.mean,
                moving.variance,
            )?;
            workspace.trained_batch = Some(batch_size);
        }
        Mode::Inference => {
            let affine = NormAffine {
                mean: moving.mean,
                variance: moving.variance,
                gamma: params.gamma,
                beta: params.beta,
                epsilon: geom.epsilon,
            };
            normalize_relu_forward(&norm, batch_size, pre_norm, &affine, None, output)?;
        }
    }
    Ok(())
}

/// Backward pass through ReLU, batch normalisation and the convolution.
///
/// Requires the cache of a training-mode forward over the same batch size.
#[allow(clippy::too_many_arguments)]
pub fn conv_batch_norm_relu_backward(
    geom: &FusedGeometry,
    batch_size: usize,
    input: &[f32],
    output: &[f32],
    grad_output: &[f32],
    params: &FusedParameters<'_>,
    workspace: &mut FusedWorkspace,
    grads: FusedGradients<'_>,
) -> std::result::Result<(), KernelError> {
    match workspace.trained_batch {
        Some(cached) if cached == batch_size => {}
        Some(cached) => {
            return Err(KernelError::BatchSizeMismatch {
                expected: cached,
                actual: batch_size,
            })
        }
        None => return Err(KernelError::MissingForwardState),
    }

    let norm = geom.norm();
    let stride = geom.conv.output_len();
    let normalized = workspace
        .normalized
        .batch_view("normalized", stride, batch_size)?;
    let grad_pre_norm = workspace
        .grad_pre_norm
        .batch_view_mut("pre_norm_gradient", stride, batch_size)?;

    let ops = NormBackward {
        output,
        grad_output,
        normalized,
        inv_std: &workspace.inv_std,
        gamma: params.gamma,
    };
    normalize_relu_backward(&norm, batch_size, &ops, grad_pre_norm, grads.gamma, grads.beta)?;

    conv2d_backward_params(
        &geom.conv,
        batch_size,
        input,
        grad_pre_norm,
        grads.weights,
        grads.bias,
    )?;
    conv2d_backward_input(&geom.conv, batch_size, params.weights, grad_pre_norm, grads.input)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const BATCH: usize = 2;

    fn geometry() -> FusedGeometry {
        FusedGeometry {
            conv: ConvGeometry {
                in_channels: 1,
                out_channels: 2,
                height: 4,
                width: 4,
                kernel_size: 3,
                padding: 1,
            },
            momentum: 0.9,
            epsilon: 1e-7,
        }
    }

    fn pattern(len: usize, stride: usize, modulus: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * stride) % modulus) as f32 / modulus as f32 - 0.5)
            .collect()
    }

    struct Fixture {
        geom: FusedGeometry,
        input: Vec<f32>,
        weights: Vec<f32>,
        bias: Vec<f32>,
        gamma: Vec<f32>,
        beta: Vec<f32>,
        moving_mean: Vec<f32>,
        moving_var: Vec<f32>,
        workspace: FusedWorkspace,
    }

    impl Fixture {
        fn new() -> Self {
            let geom = geometry();
            // beta is large enough that every activation stays positive, so the
            // loss below is smooth in every parameter.
            Self {
                input: pattern(BATCH * geom.conv.input_len(), 37, 17),
                weights: pattern(geom.conv.weight_len(), 5, 11),
                bias: vec![0.1, -0.2],
                gamma: vec![0.5, 0.4],
                beta: vec![5.0, 5.0],
                moving_mean: vec![1.0, 1.0],
                moving_var: vec![1.0, 1.0],
                workspace: FusedWorkspace::new(&geom, BATCH).unwrap(),
                geom,
            }
        }

        fn forward(&mut self, mode: Mode) -> Vec<f32> {
            let mut output = vec![0.0; BATCH * self.geom.conv.output_len()];
            let params = FusedParameters {
                weights: &self.weights,
                bias: &self.bias,
                gamma: &self.gamma,
                beta: &self.beta,
            };
            let moving = MovingStatistics {
                mean: &mut self.moving_mean,
                variance: &mut self.moving_var,
            };
            conv_batch_norm_relu_forward(
                &self.geom,
                BATCH,
                mode,
                &self.input,
                &params,
                moving,
                &mut self.workspace,
                &mut output,
            )
            .unwrap();
            output
        }
    }

    #[derive(Clone, Copy)]
    enum Slot {
        Input,
        Weights,
        Gamma,
        Beta,
    }

    fn slot(fx: &mut Fixture, slot: Slot) -> &mut Vec<f32> {
        match slot {
            Slot::Input => &mut fx.input,
            Slot::Weights => &mut fx.weights,
            Slot::Gamma => &mut fx.gamma,
            Slot::Beta => &mut fx.beta,
        }
    }

    fn numeric_gradient(fx: &mut Fixture, grad_out: &[f32], which: Slot, i: usize) -> f32 {
        let h = 1e-2f32;
        slot(fx, which)[i] += h;
        let plus = weighted_sum(&fx.forward(Mode::Training), grad_out);
        slot(fx, which)[i] -= 2.0 * h;
        let minus = weighted_sum(&fx.forward(Mode::Training), grad_out);
        slot(fx, which)[i] += h;
        ((plus - minus) / (2.0 * h as f64)) as f32
    }

    fn upstream(len: usize) -> Vec<f32> {
        pattern(len, 7, 13)
    }

    fn weighted_sum(output: &[f32], weights: &[f32]) -> f64 {
        output
            .iter()
            .zip(weights)
            .map(|(a, b)| *a as f64 * *b as f64)
            .sum()
    }

    #[test]
    fn test_training_forward_blends_moving_statistics() {
        let mut fx = Fixture::new();
        fx.forward(Mode::Training);
        let (mean, var) = fx.workspace.batch_statistics();
        let (mean, var) = (mean.to_vec(), var.to_vec());
        for c in 0..2 {
            assert_relative_eq!(fx.moving_mean[c], 0.9 + 0.1 * mean[c], epsilon = 1e-6);
            assert_relative_eq!(fx.moving_var[c], 0.9 + 0.1 * var[c], epsilon = 1e-6);
        }
        assert!(fx.workspace.has_training_state());
    }

    #[test]
    fn test_inference_forward_leaves_moving_statistics() {
        let mut fx = Fixture::new();
        let output = fx.forward(Mode::Inference);
        assert_eq!(fx.moving_mean, vec![1.0, 1.0]);
        assert_eq!(fx.moving_var, vec![1.0, 1.0]);
        assert!(output.iter().all(|v| *v >= 0.0));
        assert!(!fx.workspace.has_training_state());
    }

    #[test]
    fn test_backward_after_inference_is_rejected() {
        let mut fx = Fixture::new();
        fx.forward(Mode::Training);
        let output = fx.forward(Mode::Inference);
        let geom = fx.geom;

        let grad_out = upstream(output.len());
        let mut g_in = vec![0.0; fx.input.len()];
        let mut g_w = vec![0.0; fx.weights.len()];
        let (mut g_b, mut g_gamma, mut g_beta) = (vec![0.0; 2], vec![0.0; 2], vec![0.0; 2]);
        let params = FusedParameters {
            weights: &fx.weights,
            bias: &fx.bias,
            gamma: &fx.gamma,
            beta: &fx.beta,
        };
        let err = conv_batch_norm_relu_backward(
            &geom,
            BATCH,
            &fx.input,
            &output,
            &grad_out,
            &params,
            &mut fx.workspace,
            FusedGradients {
                input: &mut g_in,
                weights: &mut g_w,
                bias: &mut g_b,
                gamma: &mut g_gamma,
                beta: &mut g_beta,
            },
        )
        .unwrap_err();
        assert_eq!(err, KernelError::MissingForwardState);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut fx = Fixture::new();
        let output = fx.forward(Mode::Training);
        let grad_out = upstream(output.len());
        let geom = fx.geom;

        let mut g_in = vec![0.0; fx.input.len()];
        let mut g_w = vec![0.0; fx.weights.len()];
        let (mut g_b, mut g_gamma, mut g_beta) = (vec![0.0; 2], vec![0.0; 2], vec![0.0; 2]);
        {
            let params = FusedParameters {
                weights: &fx.weights,
                bias: &fx.bias,
                gamma: &fx.gamma,
                beta: &fx.beta,
            };
            conv_batch_norm_relu_backward(
                &geom,
                BATCH,
                &fx.input,
                &output,
                &grad_out,
                &params,
                &mut fx.workspace,
                FusedGradients {
                    input: &mut g_in,
                    weights: &mut g_w,
                    bias: &mut g_b,
                    gamma: &mut g_gamma,
                    beta: &mut g_beta,
                },
            )
            .unwrap();
        }

        for i in 0..g_w.len() {
            let n = numeric_gradient(&mut fx, &grad_out, Slot::Weights, i);
            assert_relative_eq!(g_w[i], n, epsilon = 1e-2);
        }
        for i in 0..g_in.len() {
            let n = numeric_gradient(&mut fx, &grad_out, Slot::Input, i);
            assert_relative_eq!(g_in[i], n, epsilon = 1e-2);
        }
        for c in 0..2 {
            let n = numeric_gradient(&mut fx, &grad_out, Slot::Gamma, c);
            assert_relative_eq!(g_gamma[c], n, epsilon = 1e-2);
            let n = numeric_gradient(&mut fx, &grad_out, Slot::Beta, c);
            assert_relative_eq!(g_beta[c], n, epsilon = 1e-2);
            // Batch norm removes any per-channel constant, bias included.
            assert_relative_eq!(g_b[c], 0.0, epsilon = 1e-4);
        }
    }
}
