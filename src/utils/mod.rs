//! Shared utilities: random numbers, row-wise activations, learning rate schedules.

pub mod activations;
pub mod lr_scheduler;
pub mod rng;

pub use activations::{argmax, softmax_rows};
pub use lr_scheduler::{LRScheduler, MilestoneDecay};
pub use rng::SimpleRng;
