//! Max pooling layer

use super::{Layer, Mode, Parameter};
use crate::error::{EngineError, KernelError, Phase, Result};
use crate::kernels::pool::{max_pool_backward, max_pool_forward, PoolGeometry};
use crate::tensor::{Shape, Tensor};

/// Non-overlapping max pooling. Records the winning position of every window
/// during forward so backward can route each output gradient to exactly one
/// input element.
#[derive(Debug)]
pub struct MaxPoolLayer {
    geom: PoolGeometry,
    argmax: Vec<u32>,
    /// Batch size of the last forward, while its argmax is valid.
    forwarded_batch: Option<usize>,
}

impl MaxPoolLayer {
    pub fn new(geom: PoolGeometry, max_batch: usize) -> Result<Self> {
        let len = geom
            .output_len()
            .checked_mul(max_batch)
            .filter(|len| *len > 0)
            .ok_or_else(|| EngineError::AllocationFailure {
                shape: Shape::ImageChw {
                    channels: geom.channels,
                    height: geom.output_height(),
                    width: geom.output_width(),
                },
                batch_size: max_batch,
                reason: "pooling index buffer would be empty or overflow".into(),
            })?;
        Ok(Self {
            geom,
            argmax: vec![0; len],
            forwarded_batch: None,
        })
    }
}

impl Layer for MaxPoolLayer {
    fn name(&self) -> &'static str {
        "max_pool"
    }

    // Mode does not change pooling.
    fn forward(
        &mut self,
        batch_size: usize,
        input: &Tensor,
        output: &mut Tensor,
        _mode: Mode,
    ) -> Result<()> {
        let fail = |e: KernelError| e.during(Phase::Forward, "max_pool");
        self.forwarded_batch = None;

        let input = input
            .batch_view("input", self.geom.input_len(), batch_size)
            .map_err(fail)?;
        let output = output
            .batch_view_mut("output", self.geom.output_len(), batch_size)
            .map_err(fail)?;
        let capacity = self.argmax.len() / self.geom.output_len();
        let indices = self
            .argmax
            .get_mut(..batch_size * self.geom.output_len())
            .ok_or(KernelError::BatchSizeMismatch {
                expected: capacity,
                actual: batch_size,
            })
            .map_err(fail)?;

        max_pool_forward(&self.geom, batch_size, input, output, indices).map_err(fail)?;
        self.forwarded_batch = Some(batch_size);
        Ok(())
    }

    fn backward(
        &mut self,
        batch_size: usize,
        _input: &Tensor,
        _output: &Tensor,
        output_gradient: &Tensor,
        input_gradient: &mut Tensor,
    ) -> Result<()> {
        let fail = |e: KernelError| e.during(Phase::Backward, "max_pool");
        match self.forwarded_batch {
            Some(b) if b == batch_size => {}
            Some(b) => {
                return Err(fail(KernelError::BatchSizeMismatch {
                    expected: b,
                    actual: batch_size,
                }))
            }
            None => return Err(fail(KernelError::MissingForwardState)),
        }

        let grad_output = output_gradient
            .batch_view("output_gradient", self.geom.output_len(), batch_size)
            .map_err(fail)?;
        let grad_input = input_gradient
            .batch_view_mut("input_gradient", self.geom.input_len(), batch_size)
            .map_err(fail)?;
        let indices = &self.argmax[..batch_size * self.geom.output_len()];

        max_pool_backward(&self.geom, batch_size, indices, grad_output, grad_input).map_err(fail)
    }

    fn input_shape(&self) -> Shape {
        Shape::ImageChw {
            channels: self.geom.channels,
            height: self.geom.height,
            width: self.geom.width,
        }
    }

    fn output_shape(&self) -> Shape {
        Shape::ImageChw {
            channels: self.geom.channels,
            height: self.geom.output_height(),
            width: self.geom.output_width(),
        }
    }

    fn parameters(&mut self) -> Vec<Parameter<'_>> {
        Vec::new()
    }

    fn parameter_count(&self) -> usize {
        0
    }
}
