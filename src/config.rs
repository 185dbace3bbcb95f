//! Configuration structures for training
//!
//! This module provides the configuration for the network shape, the Adam
//! optimizer and the training loop. Every field has a default, so a JSON file
//! only needs to name the values it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::optimizers::Regularization;

/// Fixed network hyperparameters.
///
/// These size every tensor the engine allocates; nothing is resized afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub batch_size: usize,
    pub input_channels: usize,
    pub input_height: usize,
    pub input_width: usize,
    /// Output channels of the fused convolution layer.
    pub conv_channels: usize,
    /// Square, odd kernel edge.
    pub kernel_size: usize,
    pub padding: usize,
    /// Max-pool window edge and stride.
    pub pool_size: usize,
    pub classes: usize,
    pub bn_momentum: f32,
    pub bn_epsilon: f32,
    /// Weights start uniform in `[-init_range, init_range)`.
    pub init_range: f32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            input_channels: 1,
            input_height: 20,
            input_width: 20,
            conv_channels: 32,
            kernel_size: 3,
            padding: 1,
            pool_size: 2,
            classes: 10,
            bn_momentum: 0.9,
            bn_epsilon: 1e-7,
            init_range: 0.5,
        }
    }
}

impl NetworkConfig {
    /// Spatial size of the convolution output.
    pub fn conv_output_dims(&self) -> (usize, usize) {
        (
            (self.input_height + 2 * self.padding + 1).saturating_sub(self.kernel_size),
            (self.input_width + 2 * self.padding + 1).saturating_sub(self.kernel_size),
        )
    }

    /// Features entering the dense layer.
    pub fn dense_inputs(&self) -> usize {
        let (h, w) = self.conv_output_dims();
        self.conv_channels * (h / self.pool_size) * (w / self.pool_size)
    }
}

/// Adam hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub gradient_scale: f32,
    pub regularization: Regularization,
    pub regularization_scale: f32,
    pub clip_min: f32,
    pub clip_max: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            gradient_scale: 1.0,
            regularization: Regularization::L2,
            regularization_scale: 0.01,
            clip_min: -0.5,
            clip_max: 0.5,
        }
    }
}

/// Training-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub max_epochs: usize,
    /// Length of the moving-average loss window.
    pub recent_losses: usize,
    /// Training stops once the window average drops below this.
    pub loss_threshold: f32,
    /// Epoch index at whose start the learning rate is divided by `decay_factor`.
    pub decay_epoch: usize,
    pub decay_factor: f32,
    /// Epochs between progress lines.
    pub log_interval: usize,
    /// Seed for initialisation and data; `None` seeds from the clock.
    pub seed: Option<u64>,
    /// Where the driver writes `epoch,loss,moving_average,seconds` rows.
    pub loss_log_path: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1000,
            recent_losses: 20,
            loss_threshold: 0.125,
            decay_epoch: 500,
            decay_factor: 10.0,
            log_interval: 10,
            seed: None,
            loss_log_path: None,
        }
    }
}

/// Root of a configuration file.
///
/// # Example
///
/// ```json
/// {
///   "network": { "conv_channels": 16 },
///   "optimizer": { "learning_rate": 0.005, "regularization": "none" },
///   "training": { "max_epochs": 400, "seed": 7 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub optimizer: AdamConfig,
    pub training: TrainingConfig,
}

impl EngineConfig {
    /// Reject settings that would produce empty tensors or a meaningless run.
    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        for (name, value) in [
            ("batch_size", net.batch_size),
            ("input_channels", net.input_channels),
            ("input_height", net.input_height),
            ("input_width", net.input_width),
            ("conv_channels", net.conv_channels),
            ("kernel_size", net.kernel_size),
            ("pool_size", net.pool_size),
            ("classes", net.classes),
        ] {
            if value == 0 {
                return invalid(format!("network.{name} must be positive"));
            }
        }
        if net.kernel_size % 2 == 0 {
            return invalid(format!("network.kernel_size must be odd, got {}", net.kernel_size));
        }
        let (out_h, out_w) = net.conv_output_dims();
        if out_h == 0 || out_w == 0 {
            return invalid("network.kernel_size is larger than the padded input".into());
        }
        if out_h % net.pool_size != 0 || out_w % net.pool_size != 0 {
            return invalid(format!(
                "network.pool_size {} does not divide the {}x{} feature map",
                net.pool_size, out_h, out_w
            ));
        }
        if !(0.0..1.0).contains(&net.bn_momentum) {
            return invalid("network.bn_momentum must be in [0, 1)".into());
        }
        if !positive(net.bn_epsilon) {
            return invalid("network.bn_epsilon must be positive".into());
        }
        if net.init_range.is_nan() || net.init_range < 0.0 {
            return invalid("network.init_range must be non-negative".into());
        }

        let opt = &self.optimizer;
        if !positive(opt.learning_rate) {
            return invalid("optimizer.learning_rate must be positive".into());
        }
        if !(0.0..1.0).contains(&opt.beta1) || !(0.0..1.0).contains(&opt.beta2) {
            return invalid("optimizer betas must be in [0, 1)".into());
        }
        if !positive(opt.epsilon) {
            return invalid("optimizer.epsilon must be positive".into());
        }
        if !opt.gradient_scale.is_finite() || !opt.regularization_scale.is_finite() {
            return invalid("optimizer scales must be finite".into());
        }
        if opt.clip_min.is_nan() || opt.clip_max.is_nan() || opt.clip_min > opt.clip_max {
            return invalid(format!(
                "optimizer.clip_min {} exceeds clip_max {}",
                opt.clip_min, opt.clip_max
            ));
        }

        let train = &self.training;
        if train.max_epochs == 0 {
            return invalid("training.max_epochs must be positive".into());
        }
        if train.recent_losses == 0 {
            return invalid("training.recent_losses must be positive".into());
        }
        if !positive(train.decay_factor) {
            return invalid("training.decay_factor must be positive".into());
        }
        if train.loss_threshold.is_nan() {
            return invalid("training.loss_threshold must be a number".into());
        }
        Ok(())
    }
}

fn positive(value: f32) -> bool {
    value > 0.0
}

/// Loads an engine configuration from a JSON file.
///
/// Reads the file at `path`, fills missing fields with defaults and validates
/// the result.
///
/// # Examples
///
/// ```no_run
/// use digit_trainer::config::load_config;
///
/// let cfg = load_config("config/digits.json").unwrap();
/// assert_eq!(cfg.network.batch_size, 32);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let contents = fs::read_to_string(path)?;
    let config: EngineConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
