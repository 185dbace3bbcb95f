//! Training data sources
//!
//! The engine pulls a fresh labelled mini-batch every epoch through the
//! [`BatchSource`] trait. [`SyntheticDigits`] is the built-in source; tests can
//! plug in their own.

pub mod digits;

pub use digits::{SyntheticDigits, DIGIT_BITMAPS, DIGIT_SIZE};

use crate::error::Result;
use crate::tensor::Tensor;

/// Producer of labelled mini-batches.
pub trait BatchSource {
    /// Overwrite the first `batch_size` samples of `input` with images and of
    /// `labels` with the matching one-hot rows.
    fn generate_batch(
        &mut self,
        batch_size: usize,
        input: &mut Tensor,
        labels: &mut Tensor,
    ) -> Result<()>;
}
