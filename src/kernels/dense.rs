//! Dense (fully connected) products without bias
//!
//! Weights are row-major `inputs x outputs`, so the forward pass is `Y = X W`.

use super::{check_len, gemm};
use crate::error::KernelError;

/// `output (batch x outputs) = input (batch x inputs) * weights (inputs x outputs)`.
pub fn dense_forward(
    batch_size: usize,
    inputs: usize,
    outputs: usize,
    input: &[f32],
    weights: &[f32],
    output: &mut [f32],
) -> Result<(), KernelError> {
    check_len("input", batch_size * inputs, input.len())?;
    check_len("weights", inputs * outputs, weights.len())?;
    check_len("output", batch_size * outputs, output.len())?;

    gemm(
        batch_size, outputs, inputs, input, inputs, weights, outputs, output, outputs, false,
        false, 1.0, 0.0,
    );
    Ok(())
}

/// Input gradient `dX = dY W^T` and weight gradient `dW = X^T dY`.
/// Both outputs are overwritten.
#[allow(clippy::too_many_arguments)]
pub fn dense_backward(
    batch_size: usize,
    inputs: usize,
    outputs: usize,
    input: &[f32],
    weights: &[f32],
    grad_output: &[f32],
    grad_input: &mut [f32],
    grad_weights: &mut [f32],
) -> Result<(), KernelError> {
    check_len("input", batch_size * inputs, input.len())?;
    check_len("weights", inputs * outputs, weights.len())?;
    check_len("output_gradient", batch_size * outputs, grad_output.len())?;
    check_len("input_gradient", batch_size * inputs, grad_input.len())?;
    check_len("weight_gradient", inputs * outputs, grad_weights.len())?;

    // dW (inputs x outputs) = X^T (inputs x batch) * dY (batch x outputs)
    gemm(
        inputs,
        outputs,
        batch_size,
        input,
        inputs,
        grad_output,
        outputs,
        grad_weights,
        outputs,
        true,
        false,
        1.0,
        0.0,
    );

    // dX (batch x inputs) = dY (batch x outputs) * W^T (outputs x inputs)
    gemm(
        batch_size,
        inputs,
        outputs,
        grad_output,
        outputs,
        weights,
        outputs,
        grad_input,
        inputs,
        false,
        true,
        1.0,
        0.0,
    );
    Ok(())
}
