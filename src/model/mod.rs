//! Model collaborator
//!
//! - [`ExpandableModel`]: capability contract used by the continual trainer
//! - [`IncrementalClassifier`]: reference implementation with per-task heads
//! - [`Optimizer`]: SGD, Adam and AdamW over parameter matrices

mod classifier;
mod optimizer;

pub use classifier::{ExpandableModel, IncrementalClassifier, ModelConfig};
pub use optimizer::{Adam, Optimizer, OptimizerConfig, OptimizerKind, Sgd};
