//! Layer trait definition for the network layers
//!
//! Every layer reads a caller-owned input tensor and writes into a caller-owned,
//! pre-allocated output tensor. Parameters, parameter gradients and any state
//! carried from forward to backward stay inside the layer.

use crate::error::Result;
use crate::tensor::{Shape, Tensor};

/// Whether a forward pass belongs to a training step.
///
/// Training-mode passes may update internal statistics and cache what the
/// backward pass needs; inference-mode passes must leave the layer's persistent
/// state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// A trainable parameter paired with the gradient from the last backward pass.
///
/// The value is only mutated by the optimizer; the gradient is only written by
/// the owning layer's `backward`.
pub struct Parameter<'a> {
    pub name: &'static str,
    pub value: &'a mut Tensor,
    pub gradient: &'a Tensor,
}

/// Core trait for the network layers.
///
/// # Tensor contracts
///
/// * `input` is read-only for both passes and must be the same tensor for the
///   forward and backward of one step.
/// * `output` is overwritten by `forward` and read by `backward`.
/// * `output_gradient` is read-only; `input_gradient` is overwritten.
/// * `batch_size` may be smaller than the batch the tensors were allocated for;
///   only the leading `batch_size` samples are touched.
///
/// Kernel failures are returned as [`crate::EngineError::LayerCompute`] tagged with
/// the phase and [`Layer::name`].
pub trait Layer {
    /// Short identifier used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Forward propagation through the layer.
    fn forward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        output: &mut Tensor,
        mode: Mode,
    ) -> Result<()>;

    /// Backward propagation through the layer.
    ///
    /// Writes the gradient with respect to `input` and refreshes the gradients
    /// of every parameter returned by [`Layer::parameters`].
    fn backward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        output: &Tensor,
        output_gradient: &Tensor,
        input_gradient: &mut Tensor,
    ) -> Result<()>;

    /// Per-sample input shape.
    fn input_shape(&self) -> Shape;

    /// Per-sample output shape.
    fn output_shape(&self) -> Shape;

    /// Number of input features per sample.
    fn input_size(&self) -> usize {
        self.input_shape().size()
    }

    /// Number of output features per sample.
    fn output_size(&self) -> usize {
        self.output_shape().size()
    }

    /// Trainable parameters in a stable order. Empty for parameter-free layers.
    fn parameters(&mut self) -> Vec<Parameter<'_>>;

    /// Total count of trainable scalars.
    fn parameter_count(&self) -> usize;
}
