//! Optimizer abstractions for parameter updates
//!
//! This module provides the Optimizer trait and the Adam implementation used to
//! update the network parameters during training.
//!
//! # Overview
//!
//! An optimizer step receives every trainable parameter together with its
//! gradient and its moment accumulators as one batch of [`ParameterUpdate`]s.
//! The accumulators are owned by the caller so they live exactly as long as the
//! parameters they track; the optimizer keeps only scalar state such as the
//! learning rate and the time step.
//!
//! # Example
//!
//! ```ignore
//! use digit_trainer::optimizers::{Adam, Optimizer};
//!
//! let mut optimizer = Adam::from_config(&config.optimizer);
//! optimizer.step(&mut updates)?;
//! optimizer.set_learning_rate(optimizer.learning_rate() / 10.0);
//! ```

pub mod adam;

pub use adam::{Adam, Regularization};

use crate::error::Result;
use crate::tensor::Tensor;

/// First and second raw-moment accumulators of one parameter tensor.
///
/// Zero at creation and updated in place by every optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    pub first: Tensor,
    pub second: Tensor,
}

impl Moments {
    /// Zeroed accumulators shaped like `parameter`.
    pub fn for_parameter(parameter: &Tensor) -> Result<Self> {
        Ok(Self {
            first: Tensor::zeros(parameter.shape(), parameter.batch_size())?,
            second: Tensor::zeros(parameter.shape(), parameter.batch_size())?,
        })
    }
}

/// One parameter group handed to [`Optimizer::step`].
pub struct ParameterUpdate<'a> {
    /// Reported when the group is rejected.
    pub name: &'static str,
    pub parameter: &'a mut Tensor,
    pub gradient: &'a Tensor,
    pub moments: &'a mut Moments,
}

/// Core trait for optimizers.
///
/// # State Management
///
/// Implementations may keep scalar state across steps (time step counters,
/// learning rate). Per-element state lives in the caller's [`Moments`].
pub trait Optimizer {
    /// Update every parameter group in place using its gradient.
    ///
    /// All groups of one call form a single optimizer step.
    fn step(&mut self, updates: &mut [ParameterUpdate<'_>]) -> Result<()>;

    /// Get the learning rate for this optimizer.
    fn learning_rate(&self) -> f32;

    /// Set the learning rate for this optimizer.
    ///
    /// Used by the training loop to apply learning-rate schedules.
    fn set_learning_rate(&mut self, lr: f32);
}
