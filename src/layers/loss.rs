//! Softmax cross-entropy loss layer
//!
//! Not a [`super::Layer`]: it consumes labels, yields a scalar and produces the
//! logits gradient in the same call.

use crate::error::{KernelError, Phase, Result};
use crate::kernels::loss::softmax_cross_entropy;
use crate::tensor::{Shape, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct SoftmaxCrossEntropyLoss {
    classes: usize,
}

impl SoftmaxCrossEntropyLoss {
    pub fn new(classes: usize) -> Self {
        Self { classes }
    }

    pub fn name(&self) -> &'static str {
        "softmax_cross_entropy"
    }

    pub fn input_shape(&self) -> Shape {
        Shape::Vector(self.classes)
    }

    /// Mean loss over the first `batch_size` samples of `logits` against one-hot
    /// `labels`. Writes `(softmax(logits) - labels) / batch_size` into
    /// `input_gradient`.
    pub fn forward(
        &self,
        batch_size: usize,
        logits: &Tensor,
        labels: &Tensor,
        input_gradient: &mut Tensor,
    ) -> Result<f32> {
        let fail = |e: KernelError| e.during(Phase::Loss, "softmax_cross_entropy");

        let logits = logits
            .batch_view("logits", self.classes, batch_size)
            .map_err(fail)?;
        let labels = labels
            .batch_view("labels", self.classes, batch_size)
            .map_err(fail)?;
        let gradient = input_gradient
            .batch_view_mut("logits_gradient", self.classes, batch_size)
            .map_err(fail)?;

        softmax_cross_entropy(batch_size, self.classes, logits, labels, gradient).map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_shifted_logits_give_same_loss() {
        let loss = SoftmaxCrossEntropyLoss::new(4);
        let logits = Tensor::from_vec(Shape::Vector(4), 1, vec![0.5, -1.0, 2.0, 0.0]).unwrap();
        let shifted = Tensor::from_vec(Shape::Vector(4), 1, vec![100.5, 99.0, 102.0, 100.0]).unwrap();
        let labels = Tensor::from_vec(Shape::Vector(4), 1, vec![0.0, 0.0, 1.0, 0.0]).unwrap();
        let mut grad = Tensor::zeros(Shape::Vector(4), 1).unwrap();

        let a = loss.forward(1, &logits, &labels, &mut grad).unwrap();
        let b = loss.forward(1, &shifted, &labels, &mut grad).unwrap();
        assert_relative_eq!(a, b, epsilon = 1e-5);
        assert_relative_eq!(grad.as_slice().iter().sum::<f32>(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_label_width_mismatch_is_a_loss_failure() {
        let loss = SoftmaxCrossEntropyLoss::new(4);
        let logits = Tensor::zeros(Shape::Vector(4), 1).unwrap();
        let labels = Tensor::zeros(Shape::Vector(3), 1).unwrap();
        let mut grad = Tensor::zeros(Shape::Vector(4), 1).unwrap();
        let err = loss.forward(1, &logits, &labels, &mut grad).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Loss));
    }
}
