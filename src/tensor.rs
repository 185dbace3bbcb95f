//! Tensor descriptors and the allocation primitive
//!
//! A [`Tensor`] is a shaped, exclusively owned `f32` buffer with an explicit batch
//! dimension. Its length is always `shape.size() * batch_size`. Tensors are created
//! once through [`Tensor::allocate`] and released when dropped; nothing resizes
//! them afterwards.
//!
//! Access discipline is carried by the borrow checker: a call that only reads a
//! tensor takes `&Tensor`, a call that writes it takes `&mut Tensor` and overwrites
//! every element it covers before anything reads it back. The only tensors that are
//! accumulated into across steps are the optimizer moments and the batch-norm
//! moving statistics, and each of those has a single owner.

use std::fmt;

use crate::error::{EngineError, KernelError, Result};
use crate::utils::SimpleRng;

/// Logical layout of one batch element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// A flat vector (labels, logits, per-channel parameters).
    Vector(usize),
    /// A row-major matrix (fully connected weights: rows = inputs, cols = outputs).
    MatrixRowMajor { rows: usize, cols: usize },
    /// An image stored channel-major: `[channels][height][width]`.
    ImageChw {
        channels: usize,
        height: usize,
        width: usize,
    },
    /// Convolution weights: `[out_channels][in_channels][kernel_height][kernel_width]`.
    ConvWeightsOihw {
        out_channels: usize,
        in_channels: usize,
        kernel_height: usize,
        kernel_width: usize,
    },
}

impl Shape {
    /// Dimensions of one batch element, outermost first.
    pub fn dims(&self) -> Vec<usize> {
        match *self {
            Shape::Vector(len) => vec![len],
            Shape::MatrixRowMajor { rows, cols } => vec![rows, cols],
            Shape::ImageChw {
                channels,
                height,
                width,
            } => vec![channels, height, width],
            Shape::ConvWeightsOihw {
                out_channels,
                in_channels,
                kernel_height,
                kernel_width,
            } => vec![out_channels, in_channels, kernel_height, kernel_width],
        }
    }

    /// Number of elements in one batch element, or `None` on overflow.
    pub fn checked_size(&self) -> Option<usize> {
        self.dims()
            .into_iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(dim))
    }

    /// Number of elements in one batch element.
    ///
    /// Only valid for shapes that have been allocated successfully.
    pub fn size(&self) -> usize {
        self.dims().into_iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dims()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        match self {
            Shape::Vector(_) => write!(f, "vector({})", dims),
            Shape::MatrixRowMajor { .. } => write!(f, "matrix({})", dims),
            Shape::ImageChw { .. } => write!(f, "image_chw({})", dims),
            Shape::ConvWeightsOihw { .. } => write!(f, "conv_oihw({})", dims),
        }
    }
}

/// How a freshly allocated tensor is populated.
pub enum Fill<'a> {
    Zero,
    Constant(f32),
    /// Uniform samples in `[low, high)`.
    Uniform {
        low: f32,
        high: f32,
        rng: &'a mut SimpleRng,
    },
}

/// Shaped numeric buffer with a batch dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    batch_size: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Allocate a tensor of `batch_size` elements of `shape`, populated per `fill`.
    ///
    /// Fails with [`EngineError::AllocationFailure`] for empty shapes, a zero batch,
    /// sizes that overflow `usize`, an inverted uniform range, or when the memory
    /// cannot be reserved.
    pub fn allocate(shape: Shape, batch_size: usize, fill: Fill<'_>) -> Result<Self> {
        let failure = |reason: String| EngineError::AllocationFailure {
            shape,
            batch_size,
            reason,
        };

        let per_sample = shape
            .checked_size()
            .ok_or_else(|| failure("element count overflows usize".into()))?;
        if per_sample == 0 || batch_size == 0 {
            return Err(failure("tensor would be empty".into()));
        }
        let total = per_sample
            .checked_mul(batch_size)
            .ok_or_else(|| failure("element count overflows usize".into()))?;

        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| failure(e.to_string()))?;

        match fill {
            Fill::Zero => data.resize(total, 0.0),
            Fill::Constant(value) => data.resize(total, value),
            Fill::Uniform { low, high, rng } => {
                if low.is_nan() || high.is_nan() || low > high {
                    return Err(failure(format!("invalid uniform range [{}, {})", low, high)));
                }
                data.extend((0..total).map(|_| rng.gen_range_f32(low, high)));
            }
        }

        Ok(Self {
            shape,
            batch_size,
            data,
        })
    }

    /// Zero-filled allocation.
    pub fn zeros(shape: Shape, batch_size: usize) -> Result<Self> {
        Self::allocate(shape, batch_size, Fill::Zero)
    }

    /// Wrap an existing buffer. The length must equal `shape.size() * batch_size`.
    pub fn from_vec(shape: Shape, batch_size: usize, data: Vec<f32>) -> Result<Self> {
        let expected = shape.checked_size().and_then(|s| s.checked_mul(batch_size));
        if expected != Some(data.len()) || data.is_empty() {
            return Err(EngineError::AllocationFailure {
                shape,
                batch_size,
                reason: format!("buffer holds {} elements", data.len()),
            });
        }
        Ok(Self {
            shape,
            batch_size,
            data,
        })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of batch elements the buffer was allocated for.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Elements per batch element.
    pub fn batch_stride(&self) -> usize {
        self.shape.size()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// One batch element.
    pub fn sample(&self, index: usize) -> &[f32] {
        let stride = self.batch_stride();
        &self.data[index * stride..(index + 1) * stride]
    }

    /// The first `batch_size` batch elements, for a kernel that expects
    /// `expected_stride` elements per sample.
    pub fn batch_view(
        &self,
        name: &'static str,
        expected_stride: usize,
        batch_size: usize,
    ) -> std::result::Result<&[f32], KernelError> {
        let len = self.checked_view_len(name, expected_stride, batch_size)?;
        Ok(&self.data[..len])
    }

    /// Mutable counterpart of [`Tensor::batch_view`].
    pub fn batch_view_mut(
        &mut self,
        name: &'static str,
        expected_stride: usize,
        batch_size: usize,
    ) -> std::result::Result<&mut [f32], KernelError> {
        let len = self.checked_view_len(name, expected_stride, batch_size)?;
        Ok(&mut self.data[..len])
    }

    fn checked_view_len(
        &self,
        name: &'static str,
        expected_stride: usize,
        batch_size: usize,
    ) -> std::result::Result<usize, KernelError> {
        if self.batch_stride() != expected_stride {
            return Err(KernelError::ShapeMismatch {
                tensor: name,
                expected: expected_stride,
                actual: self.batch_stride(),
            });
        }
        if batch_size == 0 || batch_size > self.batch_size {
            return Err(KernelError::BatchSizeMismatch {
                expected: self.batch_size,
                actual: batch_size,
            });
        }
        Ok(expected_stride * batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_fill_reads_back_zero() {
        let t = Tensor::zeros(
            Shape::ImageChw {
                channels: 2,
                height: 3,
                width: 4,
            },
            5,
        )
        .unwrap();
        assert_eq!(t.len(), 2 * 3 * 4 * 5);
        assert_eq!(t.batch_stride(), 24);
        assert!(t.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_constant_fill() {
        let t = Tensor::allocate(Shape::Vector(32), 1, Fill::Constant(1.0)).unwrap();
        assert!(t.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_uniform_fill_stays_in_range() {
        let mut rng = SimpleRng::new(7);
        let shape = Shape::ConvWeightsOihw {
            out_channels: 32,
            in_channels: 1,
            kernel_height: 3,
            kernel_width: 3,
        };
        let t = Tensor::allocate(
            shape,
            1,
            Fill::Uniform {
                low: -0.5,
                high: 0.5,
                rng: &mut rng,
            },
        )
        .unwrap();
        assert_eq!(t.len(), 288);
        assert!(t.as_slice().iter().all(|&v| (-0.5..0.5).contains(&v)));
    }

    #[test]
    fn test_empty_tensor_is_allocation_failure() {
        let err = Tensor::zeros(Shape::Vector(0), 4).unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));

        let err = Tensor::zeros(Shape::Vector(4), 0).unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));
    }

    #[test]
    fn test_overflowing_shape_is_allocation_failure() {
        let shape = Shape::MatrixRowMajor {
            rows: usize::MAX,
            cols: 2,
        };
        let err = Tensor::zeros(shape, 1).unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));
    }

    #[test]
    fn test_inverted_uniform_range_rejected() {
        let mut rng = SimpleRng::new(1);
        let result = Tensor::allocate(
            Shape::Vector(3),
            1,
            Fill::Uniform {
                low: 1.0,
                high: -1.0,
                rng: &mut rng,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_view_checks_stride_and_batch() {
        let t = Tensor::zeros(Shape::Vector(10), 4).unwrap();
        assert_eq!(t.batch_view("labels", 10, 3).unwrap().len(), 30);
        assert_eq!(
            t.batch_view("labels", 9, 3).unwrap_err(),
            KernelError::ShapeMismatch {
                tensor: "labels",
                expected: 9,
                actual: 10
            }
        );
        assert!(matches!(
            t.batch_view("labels", 10, 5),
            Err(KernelError::BatchSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_vec_length_checked() {
        assert!(Tensor::from_vec(Shape::Vector(3), 2, vec![0.0; 6]).is_ok());
        assert!(Tensor::from_vec(Shape::Vector(3), 2, vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_shape_display() {
        let shape = Shape::ImageChw {
            channels: 32,
            height: 20,
            width: 20,
        };
        assert_eq!(shape.to_string(), "image_chw(32x20x20)");
    }
}
