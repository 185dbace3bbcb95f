//! Softmax cross-entropy, forward and backward in one call

use super::check_len;
use crate::error::KernelError;
use crate::utils::softmax_rows;

/// Probabilities are clamped here before taking the log.
pub const MIN_PROBABILITY: f32 = 1e-12;

/// Mean cross-entropy of `softmax(logits)` against one-hot `labels`.
///
/// `grad_logits` receives `(softmax(logits) - labels) / batch_size`, the gradient
/// of the returned mean loss with respect to the logits.
pub fn softmax_cross_entropy(
    batch_size: usize,
    classes: usize,
    logits: &[f32],
    labels: &[f32],
    grad_logits: &mut [f32],
) -> Result<f32, KernelError> {
    let total = batch_size * classes;
    check_len("logits", total, logits.len())?;
    check_len("labels", total, labels.len())?;
    check_len("logits_gradient", total, grad_logits.len())?;

    grad_logits.copy_from_slice(logits);
    softmax_rows(grad_logits, batch_size, classes);

    let scale = 1.0 / batch_size as f32;
    let mut loss = 0.0f32;
    for (p, &label) in grad_logits.iter_mut().zip(labels) {
        if label != 0.0 {
            loss -= label * p.max(MIN_PROBABILITY).ln();
        }
        *p = (*p - label) * scale;
    }
    loss *= scale;

    if !loss.is_finite() {
        return Err(KernelError::NonFiniteValue { tensor: "loss" });
    }
    Ok(loss)
}
