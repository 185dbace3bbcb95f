//! Digit Trainer Library
//!
//! A small convolutional network trained with Adam on synthetic 20x20 digit
//! images: one fused convolution + batch-norm + ReLU layer, 2x2 max pooling, a
//! dense layer and a softmax cross-entropy loss.
//!
//! # Modules
//!
//! - `tensor`: Shaped, batched buffers and their allocation
//! - `kernels`: Slice-level compute for every layer (rayon, optional BLAS)
//! - `layers`: Layer trait and the four layers of the network
//! - `optimizers`: Optimizer trait and Adam with clipping and regularization
//! - `data`: Batch sources, including the synthetic digit generator
//! - `engine`: The training loop and its state machine
//! - `config`: JSON configuration with defaults and validation
//! - `utils`: RNG, softmax/arg-max helpers, learning rate schedules
//! - `error`: Error types shared by the whole crate

#[cfg(feature = "blas")]
extern crate blas_src;

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod layers;
pub mod optimizers;
pub mod tensor;
pub mod utils;

pub use config::{load_config, AdamConfig, EngineConfig, NetworkConfig, TrainingConfig};
pub use engine::{Evaluation, TrainingEngine, TrainingReport, TrainingState};
pub use error::{EngineError, KernelError, Phase, Result};
pub use tensor::{Fill, Shape, Tensor};
