//! Dense (fully connected) layer implementation
//!
//! This module provides a DenseLayer that flattens each input sample and applies
//! the transformation: output = input × weights. There is no bias and no
//! activation; the outputs are logits for the loss layer.

use super::{Layer, Mode, Parameter};
use crate::error::{KernelError, Phase, Result};
use crate::kernels::dense::{dense_backward, dense_forward};
use crate::tensor::{Fill, Shape, Tensor};
use crate::utils::SimpleRng;

/// Dense layer without bias.
///
/// Performs the linear transformation: y = xW
/// where x is the flattened input (batch_size × input_size) and
/// W is the weight matrix (input_size × output_size).
///
/// # Fields
///
/// * `input_shape` - Per-sample shape of the incoming volume (flattened on use)
/// * `output_size` - Number of output features
/// * `weights` - Weight matrix stored in row-major format (input_size × output_size)
/// * `grad_weights` - Weight gradient from the last backward pass
///
/// # Example
///
/// ```ignore
/// use digit_trainer::layers::DenseLayer;
/// use digit_trainer::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let layer = DenseLayer::new(Shape::Vector(3200), 10, 0.5, &mut rng)?;
/// assert_eq!(layer.input_size(), 3200);
/// assert_eq!(layer.output_size(), 10);
/// ```
#[derive(Debug)]
pub struct DenseLayer {
    input_shape: Shape,
    output_size: usize,
    weights: Tensor,
    grad_weights: Tensor,
}

impl DenseLayer {
    /// Create a new DenseLayer with weights drawn uniformly from
    /// `[-init_range, init_range)`.
    ///
    /// # Arguments
    ///
    /// * `input_shape` - Shape of one input sample; any shape is flattened
    /// * `output_size` - Number of output features
    /// * `init_range` - Half-width of the uniform initialisation interval
    /// * `rng` - Random number generator for weight initialization
    pub fn new(
        input_shape: Shape,
        output_size: usize,
        init_range: f32,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        let shape = Shape::MatrixRowMajor {
            rows: input_shape.size(),
            cols: output_size,
        };
        Ok(Self {
            input_shape,
            output_size,
            weights: Tensor::allocate(
                shape,
                1,
                Fill::Uniform {
                    low: -init_range,
                    high: init_range,
                    rng,
                },
            )?,
            grad_weights: Tensor::zeros(shape, 1)?,
        })
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }
}

impl Layer for DenseLayer {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn forward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        output: &mut Tensor,
        _mode: Mode,
    ) -> Result<()> {
        let fail = |e: KernelError| e.during(Phase::Forward, "dense");
        let inputs = self.input_size();

        let input = input
            .batch_view("input", inputs, batch_size)
            .map_err(fail)?;
        let output = output
            .batch_view_mut("output", self.output_size, batch_size)
            .map_err(fail)?;

        dense_forward(
            batch_size,
            inputs,
            self.output_size,
            input,
            self.weights.as_slice(),
            output,
        )
        .map_err(fail)
    }

    fn backward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        _output: &Tensor,
        output_gradient: &Tensor,
        input_gradient: &mut Tensor,
    ) -> Result<()> {
        let fail = |e: KernelError| e.during(Phase::Backward, "dense");
        let inputs = self.input_size();

        let input = input
            .batch_view("input", inputs, batch_size)
            .map_err(fail)?;
        let grad_output = output_gradient
            .batch_view("output_gradient", self.output_size, batch_size)
            .map_err(fail)?;
        let grad_input = input_gradient
            .batch_view_mut("input_gradient", inputs, batch_size)
            .map_err(fail)?;

        dense_backward(
            batch_size,
            inputs,
            self.output_size,
            input,
            self.weights.as_slice(),
            grad_output,
            grad_input,
            self.grad_weights.as_mut_slice(),
        )
        .map_err(fail)
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::Vector(self.output_size)
    }

    fn parameters(&mut self) -> Vec<Parameter<'_>> {
        vec![Parameter {
            name: "dense_weights",
            value: &mut self.weights,
            gradient: &self.grad_weights,
        }]
    }

    /// input_size × output_size weights.
    fn parameter_count(&self) -> usize {
        self.weights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_layer_creation() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new(Shape::Vector(10), 5, 0.5, &mut rng).unwrap();

        assert_eq!(layer.input_size(), 10);
        assert_eq!(layer.output_size(), 5);
        assert_eq!(layer.parameter_count(), 50); // 10 × 5
    }

    #[test]
    fn test_flattens_image_input() {
        let mut rng = SimpleRng::new(42);
        let input_shape = Shape::ImageChw {
            channels: 32,
            height: 10,
            width: 10,
        };
        let layer = DenseLayer::new(input_shape, 10, 0.5, &mut rng).unwrap();
        assert_eq!(layer.input_size(), 3200);
        assert_eq!(layer.parameter_count(), 32_000);
    }

    #[test]
    fn test_uniform_initialization() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new(Shape::Vector(100), 50, 0.5, &mut rng).unwrap();

        for &weight in layer.weights.as_slice() {
            assert!(
                (-0.5..0.5).contains(&weight),
                "Weight {} outside [-0.5, 0.5)",
                weight
            );
        }
    }

    #[test]
    fn test_deterministic_initialization() {
        let mut rng1 = SimpleRng::new(42);
        let layer1 = DenseLayer::new(Shape::Vector(10), 5, 0.5, &mut rng1).unwrap();

        let mut rng2 = SimpleRng::new(42);
        let layer2 = DenseLayer::new(Shape::Vector(10), 5, 0.5, &mut rng2).unwrap();

        // Same seed should produce identical weights
        assert_eq!(layer1.weights, layer2.weights);
    }

    #[test]
    fn test_backward_fills_weight_gradient() {
        let mut rng = SimpleRng::new(7);
        let mut layer = DenseLayer::new(Shape::Vector(3), 2, 0.5, &mut rng).unwrap();
        let input = Tensor::from_vec(Shape::Vector(3), 1, vec![1.0, 2.0, 3.0]).unwrap();
        let mut output = Tensor::zeros(Shape::Vector(2), 1).unwrap();
        layer.forward(1, &input, &mut output, Mode::Training).unwrap();

        let grad_out = Tensor::from_vec(Shape::Vector(2), 1, vec![1.0, 0.0]).unwrap();
        let mut grad_in = Tensor::zeros(Shape::Vector(3), 1).unwrap();
        layer
            .backward(1, &input, &output, &grad_out, &mut grad_in)
            .unwrap();

        let params = layer.parameters();
        assert_eq!(params[0].gradient.as_slice(), &[1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
    }
}
