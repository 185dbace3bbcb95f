//! Layer abstractions for the digit network
//!
//! This module provides the Layer trait and the layers the fixed topology is
//! built from: fused conv + batch norm + ReLU, max pooling, dense, and the
//! softmax cross-entropy loss.

mod r#trait;
pub mod dense;
pub mod fused;
pub mod loss;
pub mod pool;

// Re-export the Layer trait for convenience
pub use r#trait::{Layer, Mode, Parameter};
pub use dense::DenseLayer;
pub use fused::FusedConvBatchNormLayer;
pub use loss::SoftmaxCrossEntropyLoss;
pub use pool::MaxPoolLayer;
