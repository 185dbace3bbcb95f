//! Adam (Adaptive Moment Estimation) optimizer implementation
//!
//! This module provides the Adam optimizer used by the training engine. On top of
//! the textbook update it clips every gradient element to a fixed interval and
//! adds a regularization term before the moments are updated.

use serde::{Deserialize, Serialize};

use super::{Moments, Optimizer, ParameterUpdate};
use crate::config::AdamConfig;
use crate::error::{KernelError, Phase, Result};

/// Penalty added to each (clipped) gradient element before the moment update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regularization {
    None,
    /// `gradient += scale * sign(parameter)`
    L1,
    /// `gradient += scale * parameter`
    #[default]
    L2,
}

impl Regularization {
    #[inline]
    fn penalty(self, scale: f32, parameter: f32) -> f32 {
        match self {
            Regularization::None => 0.0,
            Regularization::L1 => {
                if parameter > 0.0 {
                    scale
                } else if parameter < 0.0 {
                    -scale
                } else {
                    0.0
                }
            }
            Regularization::L2 => scale * parameter,
        }
    }
}

/// Adam (Adaptive Moment Estimation) optimizer.
///
/// For every element of every parameter group the update is:
///
/// ```text
/// g     = clamp(gradient, clip_min, clip_max) + penalty(parameter)
/// m     = β1 * m + (1 - β1) * g
/// v     = β2 * v + (1 - β2) * g²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// parameter -= α * gradient_scale * m_hat / (√v_hat + ε)
/// ```
///
/// where:
/// - α (alpha) is the learning rate
/// - β1 (beta1) is the exponential decay rate for first moment estimates
/// - β2 (beta2) is the exponential decay rate for second moment estimates
/// - ε (epsilon) is a small constant for numerical stability
/// - t is the time step, starting at 1
///
/// Unlike a per-tensor optimizer, `t` is shared: every group in one
/// [`Optimizer::step`] call sees the same `t`, and `t` advances once per call.
/// The moment accumulators belong to the caller (one [`Moments`] per group).
///
/// # Example
///
/// ```ignore
/// use digit_trainer::optimizers::{Adam, Moments, Optimizer, ParameterUpdate};
///
/// let mut optimizer = Adam::from_config(&AdamConfig::default());
/// let mut moments = Moments::for_parameter(&weights)?;
/// optimizer.step(&mut [ParameterUpdate {
///     name: "weights",
///     parameter: &mut weights,
///     gradient: &grad_weights,
///     moments: &mut moments,
/// }])?;
/// ```
///
/// # Reference
///
/// Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
/// arXiv preprint arXiv:1412.6980.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    gradient_scale: f32,
    regularization: Regularization,
    regularization_scale: f32,
    clip_min: f32,
    clip_max: f32,
    /// Time step used for bias correction of the next step.
    t: i32,
}

impl Adam {
    /// Creates a new Adam optimizer from its configuration.
    pub fn from_config(config: &AdamConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            gradient_scale: config.gradient_scale,
            regularization: config.regularization,
            regularization_scale: config.regularization_scale,
            clip_min: config.clip_min,
            clip_max: config.clip_max,
            t: 1,
        }
    }

    /// Time step the next call to `step` will use.
    pub fn time_step(&self) -> i32 {
        self.t
    }

    fn update_group(&self, update: &mut ParameterUpdate<'_>) -> Result<()> {
        let name = update.name;
        let fail = |e: KernelError| e.during(Phase::Optimizer, name);
        let len = update.parameter.len();
        check_group(len, update.gradient.len(), "gradient").map_err(fail)?;
        check_group(len, update.moments.first.len(), "first_moment").map_err(fail)?;
        check_group(len, update.moments.second.len(), "second_moment").map_err(fail)?;

        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);
        let step_size = self.learning_rate * self.gradient_scale;

        let Moments { first, second } = &mut *update.moments;
        let gradients = update.gradient.as_slice();
        let parameters = update.parameter.as_mut_slice();

        for (((p, &raw), m), v) in parameters
            .iter_mut()
            .zip(gradients)
            .zip(first.as_mut_slice())
            .zip(second.as_mut_slice())
        {
            let g = raw.max(self.clip_min).min(self.clip_max)
                + self.regularization.penalty(self.regularization_scale, *p);

            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;

            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            *p -= step_size * m_hat / (v_hat.sqrt() + self.epsilon);
        }

        if parameters.iter().any(|p| !p.is_finite()) {
            return Err(fail(KernelError::NonFiniteValue { tensor: "parameter" }));
        }
        Ok(())
    }
}

fn check_group(
    expected: usize,
    actual: usize,
    tensor: &'static str,
) -> std::result::Result<(), KernelError> {
    if expected != actual {
        return Err(KernelError::ShapeMismatch {
            tensor,
            expected,
            actual,
        });
    }
    Ok(())
}

impl Optimizer for Adam {
    /// Apply one Adam step to every group, then advance the shared time step.
    ///
    /// Stops at the first group whose tensors disagree in length; earlier groups
    /// have already been updated and `t` is left unchanged.
    fn step(&mut self, updates: &mut [ParameterUpdate<'_>]) -> Result<()> {
        for update in updates.iter_mut() {
            self.update_group(update)?;
        }
        self.t = self.t.saturating_add(1);
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
