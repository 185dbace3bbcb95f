//! Fused convolution + batch normalisation + ReLU layer
//!
//! The convolution feeds straight into per-channel batch normalisation and a
//! rectified-linear activation. Forward and backward each run as one fused unit,
//! so the layer produces all five gradients (input, conv weights, conv bias,
//! gamma, beta) in a single backward call.

use super::{Layer, Mode, Parameter};
use crate::error::{Phase, Result};
use crate::kernels::conv::ConvGeometry;
use crate::kernels::fused::{
    conv_batch_norm_relu_backward, conv_batch_norm_relu_forward, FusedGeometry, FusedGradients,
    FusedParameters, FusedWorkspace, MovingStatistics,
};
use crate::tensor::{Fill, Shape, Tensor};
use crate::utils::SimpleRng;

/// Convolution (stride 1, zero padding) followed by batch norm and ReLU.
///
/// # Fields
///
/// * `weights` - Kernels laid out `[out][in][ky][kx]`, uniform in `[-r, r]` at start
/// * `bias` - Per-output-channel bias, zero at start
/// * `gamma` / `beta` - Batch-norm scale (one) and shift (zero)
/// * `moving_mean` / `moving_variance` - Inference statistics, both start at one
///
/// # Example
///
/// ```ignore
/// let mut rng = SimpleRng::new(42);
/// let geom = FusedGeometry { conv, momentum: 0.9, epsilon: 1e-7 };
/// let layer = FusedConvBatchNormLayer::new(geom, 0.5, 32, &mut rng)?;
/// assert_eq!(layer.output_size(), 32 * 20 * 20);
/// ```
#[derive(Debug)]
pub struct FusedConvBatchNormLayer {
    geom: FusedGeometry,
    weights: Tensor,
    bias: Tensor,
    gamma: Tensor,
    beta: Tensor,
    moving_mean: Tensor,
    moving_variance: Tensor,
    grad_weights: Tensor,
    grad_bias: Tensor,
    grad_gamma: Tensor,
    grad_beta: Tensor,
    workspace: FusedWorkspace,
}

impl FusedConvBatchNormLayer {
    /// Allocate parameters and workspace for batches of up to `max_batch` samples.
    pub fn new(
        geom: FusedGeometry,
        init_range: f32,
        max_batch: usize,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        let conv = geom.conv;
        let weight_shape = Shape::ConvWeightsOihw {
            out_channels: conv.out_channels,
            in_channels: conv.in_channels,
            kernel_height: conv.kernel_size,
            kernel_width: conv.kernel_size,
        };
        let channels = Shape::Vector(conv.out_channels);

        Ok(Self {
            weights: Tensor::allocate(
                weight_shape,
                1,
                Fill::Uniform {
                    low: -init_range,
                    high: init_range,
                    rng,
                },
            )?,
            bias: Tensor::zeros(channels, 1)?,
            gamma: Tensor::allocate(channels, 1, Fill::Constant(1.0))?,
            beta: Tensor::zeros(channels, 1)?,
            moving_mean: Tensor::allocate(channels, 1, Fill::Constant(1.0))?,
            moving_variance: Tensor::allocate(channels, 1, Fill::Constant(1.0))?,
            grad_weights: Tensor::zeros(weight_shape, 1)?,
            grad_bias: Tensor::zeros(channels, 1)?,
            grad_gamma: Tensor::zeros(channels, 1)?,
            grad_beta: Tensor::zeros(channels, 1)?,
            workspace: FusedWorkspace::new(&geom, max_batch)?,
            geom,
        })
    }

    pub fn geometry(&self) -> &FusedGeometry {
        &self.geom
    }

    /// Moving mean and variance used by inference-mode forwards.
    pub fn moving_statistics(&self) -> (&[f32], &[f32]) {
        (self.moving_mean.as_slice(), self.moving_variance.as_slice())
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    fn conv(&self) -> &ConvGeometry {
        &self.geom.conv
    }
}

impl Layer for FusedConvBatchNormLayer {
    fn name(&self) -> &'static str {
        "conv_bn_relu"
    }

    fn forward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        output: &mut Tensor,
        mode: Mode,
    ) -> Result<()> {
        let name = self.name();
        let fail = |e: crate::error::KernelError| e.during(Phase::Forward, name);

        let input = input
            .batch_view("input", self.conv().input_len(), batch_size)
            .map_err(fail)?;
        let output = output
            .batch_view_mut("output", self.conv().output_len(), batch_size)
            .map_err(fail)?;

        let params = FusedParameters {
            weights: self.weights.as_slice(),
            bias: self.bias.as_slice(),
            gamma: self.gamma.as_slice(),
            beta: self.beta.as_slice(),
        };
        let moving = MovingStatistics {
            mean: self.moving_mean.as_mut_slice(),
            variance: self.moving_variance.as_mut_slice(),
        };
        conv_batch_norm_relu_forward(
            &self.geom,
            batch_size,
            mode,
            input,
            &params,
            moving,
            &mut self.workspace,
            output,
        )
        .map_err(fail)
    }

    fn backward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        output: &Tensor,
        output_gradient: &Tensor,
        input_gradient: &mut Tensor,
    ) -> Result<()> {
        let name = self.name();
        let fail = |e: crate::error::KernelError| e.during(Phase::Backward, name);
        let in_len = self.conv().input_len();
        let out_len = self.conv().output_len();

        let input = input.batch_view("input", in_len, batch_size).map_err(fail)?;
        let output = output
            .batch_view("output", out_len, batch_size)
            .map_err(fail)?;
        let grad_output = output_gradient
            .batch_view("output_gradient", out_len, batch_size)
            .map_err(fail)?;
        let grad_input = input_gradient
            .batch_view_mut("input_gradient", in_len, batch_size)
            .map_err(fail)?;

        let params = FusedParameters {
            weights: self.weights.as_slice(),
            bias: self.bias.as_slice(),
            gamma: self.gamma.as_slice(),
            beta: self.beta.as_slice(),
        };
        let grads = FusedGradients {
            input: grad_input,
            weights: self.grad_weights.as_mut_slice(),
            bias: self.grad_bias.as_mut_slice(),
            gamma: self.grad_gamma.as_mut_slice(),
            beta: self.grad_beta.as_mut_slice(),
        };
        conv_batch_norm_relu_backward(
            &self.geom,
            batch_size,
            input,
            output,
            grad_output,
            &params,
            &mut self.workspace,
            grads,
        )
        .map_err(fail)
    }

    fn input_shape(&self) -> Shape {
        Shape::ImageChw {
            channels: self.conv().in_channels,
            height: self.conv().height,
            width: self.conv().width,
        }
    }

    fn output_shape(&self) -> Shape {
        Shape::ImageChw {
            channels: self.conv().out_channels,
            height: self.conv().output_height(),
            width: self.conv().output_width(),
        }
    }

    fn parameters(&mut self) -> Vec<Parameter<'_>> {
        vec![
            Parameter {
                name: "conv_weights",
                value: &mut self.weights,
                gradient: &self.grad_weights,
            },
            Parameter {
                name: "conv_bias",
                value: &mut self.bias,
                gradient: &self.grad_bias,
            },
            Parameter {
                name: "bn_gamma",
                value: &mut self.gamma,
                gradient: &self.grad_gamma,
            },
            Parameter {
                name: "bn_beta",
                value: &mut self.beta,
                gradient: &self.grad_beta,
            },
        ]
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len() + self.gamma.len() + self.beta.len()
    }
}
