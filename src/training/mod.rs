//! Training, evaluation and metrics
//!
//! - [`ContinualTrainer`]: per-task expand, replay, train, evaluate, register
//! - [`Evaluator`]: cumulative inference over all tasks seen so far
//! - [`ContinualLogger`]: accuracy matrix, forgetting, backward transfer

mod evaluator;
pub mod losses;
mod metrics;
mod trainer;

pub use evaluator::{Evaluator, TaskEval};
pub use metrics::{ContinualLogger, MetricLogger, MetricSink, SmoothedValue, Subset};
pub use trainer::{
    ContinualTrainer, Device, EpochStats, PreparedTask, RunReport, TaskOutcome, TrainerConfig,
    TrainerPhase,
};
