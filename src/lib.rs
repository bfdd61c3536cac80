//! # Generative Rehearsal for Continual Learning
//!
//! This crate implements task-incremental continual learning with generative
//! pseudo-rehearsal. Instead of storing raw exemplars of earlier classes, a
//! compact density model is fitted per class and sampled later to replay old
//! classes while the model learns new ones.
//!
//! ## Features
//!
//! - Per-class Gaussian and Gaussian-mixture (BIC model selection) rehearsal
//! - Insertion-ordered rehearsal state with versioned JSON persistence
//! - Continual trainer: expansion, freezing, replay injection, cumulative evaluation
//! - Continual-learning metrics (average accuracy, forgetting, backward transfer)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use generative_rehearsal::prelude::*;
//!
//! let config = RehearsalConfig::new("har")
//!     .kind(RehearsalKind::GaussianMixtureModel)
//!     .num_samples_per_class(50)
//!     .seed(Some(7));
//! let mut rehearsal = build_rehearsal(config)?;
//! rehearsal.register_task(&task_zero)?;
//! let replay = rehearsal.generate(50)?;
//! ```

pub mod config;
pub mod data;
pub mod model;
pub mod rehearsal;
pub mod training;
pub mod utils;

// Re-exports
pub use config::Config;
pub use data::{TaskData, TaskSequence, TaskSplit};
pub use model::{ExpandableModel, IncrementalClassifier, ModelConfig};
pub use rehearsal::{build_rehearsal, Rehearsal, RehearsalConfig, RehearsalKind};
pub use training::{ContinualLogger, ContinualTrainer, MetricSink, Subset, TrainerConfig};

/// Identifier of a class as it appears in task labels.
pub type ClassId = usize;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::data::{DataLoader, TaskData, TaskSequence, TaskSplit};
    pub use crate::model::{
        ExpandableModel, IncrementalClassifier, ModelConfig, Optimizer, OptimizerConfig,
        OptimizerKind,
    };
    pub use crate::rehearsal::{
        build_rehearsal, GaussianFitter, MixtureFitter, Rehearsal, RehearsalConfig,
        RehearsalKind, RehearsalSnapshot, RehearsalStore, TaskRegistration,
    };
    pub use crate::training::{
        ContinualLogger, ContinualTrainer, Device, Evaluator, MetricSink, RunReport, Subset,
        TrainerConfig,
    };
    pub use crate::{ClassId, RehearsalError, Result};
}

/// Error types for the crate
#[derive(thiserror::Error, Debug)]
pub enum RehearsalError {
    #[error("Shape mismatch: {features} feature rows but {labels} labels")]
    ShapeMismatch { features: usize, labels: usize },

    #[error("Degenerate distribution for class {class_id}: {reason}")]
    DegenerateDistribution { class_id: ClassId, reason: String },

    #[error("Fit failed for class {class_id}: {reason}")]
    Fit { class_id: ClassId, reason: String },

    #[error("I/O error at {}: {source}", path.display())]
    Persistence {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error at {}: {source}", path.display())]
    Serialization {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Non-finite loss at task {task_id}, epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        task_id: usize,
        epoch: usize,
        batch: usize,
    },

    #[error("Data error: {0}")]
    Data(String),
}

pub type Result<T> = std::result::Result<T, RehearsalError>;

impl RehearsalError {
    /// Whether the error only affects rehearsal coverage of a single class.
    pub fn is_class_local(&self) -> bool {
        matches!(
            self,
            RehearsalError::DegenerateDistribution { .. } | RehearsalError::Fit { .. }
        )
    }
}
