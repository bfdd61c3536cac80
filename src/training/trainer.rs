//! Continual training loop.
//!
//! Tasks are processed strictly in order. For every task after the first the
//! model is expanded and its old parameters frozen, then replay rows are drawn
//! from the rehearsal state as it stood before this task and mixed with the
//! real rows. After training, every task seen so far is evaluated and the
//! task's real rows are registered for future replay.

use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::evaluator::{Evaluator, TaskEval};
use super::losses::{accuracy, argmax_rows, cross_entropy, top_k};
use super::metrics::{ContinualLogger, MetricLogger, MetricSink, Subset};
use crate::data::{DataLoader, TaskData, TaskSequence};
use crate::model::{ExpandableModel, Optimizer, OptimizerConfig};
use crate::rehearsal::{Rehearsal, TaskRegistration};
use crate::{ClassId, RehearsalError, Result};

/// Compute device, passed explicitly to the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Epochs per task
    pub n_epochs: usize,
    pub batch_size: usize,
    /// Classes in the first task
    pub base_increment: usize,
    /// Classes in every later task
    pub increment: usize,
    pub optimizer: OptimizerConfig,
    /// Root for persisted model and rehearsal state
    pub save_dir: PathBuf,
    /// Persist model and rehearsal state when the run finishes
    pub save_model: bool,
    pub dataset_name: String,
    pub device: Device,
    /// Seed for batch shuffling; entropy when absent
    pub shuffle_seed: Option<u64>,
    /// Skip a trailing partial training batch
    pub drop_last: bool,
    /// Log every n-th batch, 0 disables batch lines
    pub log_every: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            n_epochs: 10,
            batch_size: 32,
            base_increment: 2,
            increment: 2,
            optimizer: OptimizerConfig::default(),
            save_dir: PathBuf::from("saves"),
            save_model: false,
            dataset_name: "default".to_string(),
            device: Device::Cpu,
            shuffle_seed: None,
            drop_last: false,
            log_every: 10,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_epochs == 0 {
            return Err(RehearsalError::InvalidConfig("n_epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(RehearsalError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.base_increment == 0 || self.increment == 0 {
            return Err(RehearsalError::InvalidConfig(
                "base_increment and increment must be at least 1".into(),
            ));
        }
        if self.dataset_name.is_empty() {
            return Err(RehearsalError::InvalidConfig("dataset_name must not be empty".into()));
        }
        self.optimizer.validate()
    }

    /// `save_dir/dataset_name/model.json`
    pub fn model_path(&self) -> PathBuf {
        self.save_dir.join(&self.dataset_name).join("model.json")
    }
}

/// Where the trainer is in the per-task sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    TaskEntry(usize),
    Expand(usize),
    Freeze(usize),
    RehearsalGenerate(usize),
    Augment(usize),
    Train { task_id: usize, epoch: usize },
    EvaluateCumulative(usize),
    RegisterTask(usize),
    Finished,
}

/// Aggregates of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub batches: usize,
    pub loss: f64,
    /// Top-1 accuracy in percent.
    pub acc1: f64,
    /// Top-k accuracy in percent.
    pub acck: f64,
    pub duration: Duration,
}

/// Training set for one task after augmentation.
#[derive(Debug, Clone)]
pub struct PreparedTask {
    pub task_id: usize,
    pub train: TaskData,
    pub real_rows: usize,
    pub synthetic_rows: usize,
}

/// Everything recorded for one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: usize,
    /// Model classes while training this task.
    pub num_classes: usize,
    pub real_rows: usize,
    pub synthetic_rows: usize,
    pub epochs: Vec<EpochStats>,
    pub evaluation: Vec<TaskEval>,
    pub registration: TaskRegistration,
}

/// Summary of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tasks: Vec<TaskOutcome>,
    /// Test accuracy (fraction) on task `j` after training task `i`.
    pub accuracy_matrix: Vec<Vec<f64>>,
    pub average_incremental_accuracy: f64,
    pub forgetting: f64,
    pub backward_transfer: f64,
    /// Classes without rehearsal coverage at the end of the run.
    pub uncovered_classes: Vec<ClassId>,
    pub rehearsal_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

impl RunReport {
    /// Overall test accuracy after the last task, as a fraction.
    pub fn final_accuracy(&self) -> f64 {
        let Some(last) = self.tasks.last() else {
            return 0.0;
        };
        let (hits, total) = last.evaluation.iter().fold((0.0, 0usize), |(h, t), e| {
            (h + e.acc1 / 100.0 * e.samples as f64, t + e.samples)
        });
        if total == 0 {
            0.0
        } else {
            hits / total as f64
        }
    }
}

/// Drives model, optimizer and rehearsal through the task sequence.
pub struct ContinualTrainer<M: ExpandableModel> {
    config: TrainerConfig,
    model: M,
    rehearsal: Box<dyn Rehearsal>,
    optimizer: Box<dyn Optimizer>,
    tasks: TaskSequence,
    logger: ContinualLogger,
    evaluator: Evaluator,
    rng: StdRng,
    phase: TrainerPhase,
    history: Vec<TrainerPhase>,
    next_task: usize,
}

impl<M: ExpandableModel> ContinualTrainer<M> {
    pub fn new(
        config: TrainerConfig,
        model: M,
        rehearsal: Box<dyn Rehearsal>,
        tasks: TaskSequence,
    ) -> Result<Self> {
        config.validate()?;
        if tasks.num_tasks() == 0 {
            return Err(RehearsalError::Data("task sequence is empty".to_string()));
        }
        if model.num_classes() != tasks.classes_per_task[0] {
            return Err(RehearsalError::Model(format!(
                "model starts with {} classes but task 0 has {}",
                model.num_classes(),
                tasks.classes_per_task[0]
            )));
        }

        info!("Using device: {}", config.device);
        let rng = match config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let optimizer = config.optimizer.build();
        let evaluator = Evaluator::new(config.batch_size, config.log_every);

        Ok(Self {
            config,
            model,
            rehearsal,
            optimizer,
            tasks,
            logger: ContinualLogger::new(),
            evaluator,
            rng,
            phase: TrainerPhase::TaskEntry(0),
            history: Vec::new(),
            next_task: 0,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn rehearsal(&self) -> &dyn Rehearsal {
        self.rehearsal.as_ref()
    }

    pub fn logger(&self) -> &ContinualLogger {
        &self.logger
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[TrainerPhase] {
        &self.history
    }

    /// Index of the next task to process.
    pub fn next_task(&self) -> usize {
        self.next_task
    }

    fn enter(&mut self, phase: TrainerPhase) {
        debug!("Phase {:?}", phase);
        self.phase = phase;
        self.history.push(phase);
    }

    /// Expand, freeze, generate replay and build the augmented training set.
    pub fn prepare_task(&mut self, task_id: usize) -> Result<PreparedTask> {
        if task_id != self.next_task || task_id >= self.tasks.num_tasks() {
            return Err(RehearsalError::InvalidConfig(format!(
                "task {} requested but task {} of {} is next",
                task_id,
                self.next_task,
                self.tasks.num_tasks()
            )));
        }
        self.enter(TrainerPhase::TaskEntry(task_id));

        let real = self.tasks.tasks[task_id].train.clone();
        if task_id == 0 {
            let real_rows = real.len();
            return Ok(PreparedTask {
                task_id,
                train: real,
                real_rows,
                synthetic_rows: 0,
            });
        }

        self.enter(TrainerPhase::Expand(task_id));
        info!("Expanding model");
        self.model.expand_model(self.tasks.classes_per_task[task_id])?;

        self.enter(TrainerPhase::Freeze(task_id));
        self.model.freeze_old_params();
        self.optimizer.reset();

        self.enter(TrainerPhase::RehearsalGenerate(task_id));
        let n = self.rehearsal.config().num_samples_per_class;
        let synthetic = self.rehearsal.generate(n)?;
        if !self.rehearsal.uncovered_classes().is_empty() {
            warn!(
                "Classes without rehearsal coverage: {:?}",
                self.rehearsal.uncovered_classes()
            );
        }

        self.enter(TrainerPhase::Augment(task_id));
        let augmented = real.concat(&synthetic)?;
        info!(
            "Task {}: {} real + {} synthetic rows",
            task_id,
            real.len(),
            synthetic.len()
        );

        Ok(PreparedTask {
            task_id,
            real_rows: real.len(),
            synthetic_rows: synthetic.len(),
            train: augmented,
        })
    }

    /// One pass over `data` with a gradient step per batch.
    pub fn train_one_epoch(
        &mut self,
        task_id: usize,
        epoch: usize,
        data: &TaskData,
    ) -> Result<EpochStats> {
        self.enter(TrainerPhase::Train { task_id, epoch });
        let start = Instant::now();
        let header = format!("Task: [{}] Epoch: [{}]", task_id, epoch);
        let k = top_k(self.model.num_classes());

        let loader = DataLoader::new(data.len(), self.config.batch_size)
            .shuffled(&mut self.rng)
            .with_drop_last(self.config.drop_last);
        let num_batches = loader.num_batches();
        let mut meters = MetricLogger::default();
        let mut iter_time = Instant::now();

        for (batch, indices) in loader.enumerate() {
            let x = data.features.select(Axis(0), &indices);
            let targets: Vec<usize> = indices.iter().map(|&i| data.labels[i]).collect();

            let logits = self.model.forward(x.view())?;
            let (loss, grad) = cross_entropy(logits.view(), &targets)?;
            if !loss.is_finite() {
                return Err(RehearsalError::NonFiniteLoss {
                    task_id,
                    epoch,
                    batch,
                });
            }
            let acc1 = accuracy(logits.view(), &targets, 1)?;
            let acck = accuracy(logits.view(), &targets, k)?;

            let n = targets.len();
            meters.update("loss", loss, n);
            meters.update("acc1", acc1, n);
            meters.update(&format!("acc{}", k), acck, n);

            let grads = self.model.backward(x.view(), grad.view())?;
            let mut params = self.model.trainable_params_mut();
            self.optimizer.step(&mut params, &grads)?;

            let predictions = argmax_rows(logits.view());
            self.logger
                .add(&predictions, &targets, &vec![task_id; n], Subset::Train)?;

            meters.update("time", iter_time.elapsed().as_secs_f64(), 1);
            iter_time = Instant::now();
            if self.config.log_every > 0 && batch % self.config.log_every == 0 {
                meters.log_batch(&header, batch, num_batches);
            }
        }

        let duration = start.elapsed();
        info!(
            "{} Total time: {:.3}s ({:.4} s / it)",
            header,
            duration.as_secs_f64(),
            duration.as_secs_f64() / num_batches.max(1) as f64
        );

        Ok(EpochStats {
            epoch,
            batches: num_batches,
            loss: meters.global_avg("loss"),
            acc1: meters.global_avg("acc1"),
            acck: meters.global_avg(&format!("acc{}", k)),
            duration,
        })
    }

    /// Evaluate tasks `0..=task_id` and close the logger step.
    pub fn evaluate(&mut self, task_id: usize) -> Result<Vec<TaskEval>> {
        self.enter(TrainerPhase::EvaluateCumulative(task_id));
        let val_sets: Vec<&TaskData> = self.tasks.tasks[..=task_id]
            .iter()
            .map(|t| &t.val)
            .collect();
        let results = self
            .evaluator
            .evaluate(&self.model, &val_sets, &mut self.logger)?;
        self.logger.end_task();
        Ok(results)
    }

    /// Fit the task's real training rows into the rehearsal state.
    pub fn register_task(&mut self, task_id: usize) -> Result<TaskRegistration> {
        self.enter(TrainerPhase::RegisterTask(task_id));
        let registration = self
            .rehearsal
            .register_task(&self.tasks.tasks[task_id].train)?;
        self.next_task = task_id + 1;
        Ok(registration)
    }

    /// Process one task end to end.
    pub fn run_task(&mut self, task_id: usize) -> Result<TaskOutcome> {
        let prepared = self.prepare_task(task_id)?;

        let mut epochs = Vec::with_capacity(self.config.n_epochs);
        for epoch in 0..self.config.n_epochs {
            epochs.push(self.train_one_epoch(task_id, epoch, &prepared.train)?);
        }

        let evaluation = self.evaluate(task_id)?;
        let registration = self.register_task(task_id)?;

        Ok(TaskOutcome {
            task_id,
            num_classes: self.model.num_classes(),
            real_rows: prepared.real_rows,
            synthetic_rows: prepared.synthetic_rows,
            epochs,
            evaluation,
            registration,
        })
    }

    /// Process every remaining task, then persist if configured.
    pub fn run(&mut self) -> Result<RunReport> {
        let mut outcomes = Vec::with_capacity(self.tasks.num_tasks());
        for task_id in self.next_task..self.tasks.num_tasks() {
            outcomes.push(self.run_task(task_id)?);
        }
        self.enter(TrainerPhase::Finished);

        let (rehearsal_path, model_path) = if self.config.save_model {
            let rehearsal_path = self.rehearsal.save()?;
            let model_path = self.config.model_path();
            self.model.save(&model_path)?;
            (Some(rehearsal_path), Some(model_path))
        } else {
            (None, None)
        };

        let report = RunReport {
            tasks: outcomes,
            accuracy_matrix: self.logger.accuracy_matrix(),
            average_incremental_accuracy: self.logger.average_incremental_accuracy(),
            forgetting: self.logger.forgetting(),
            backward_transfer: self.logger.backward_transfer(),
            uncovered_classes: self.rehearsal.uncovered_classes().to_vec(),
            rehearsal_path,
            model_path,
        };
        info!(
            "Run finished: avg incremental acc {:.4}, forgetting {:.4}",
            report.average_incremental_accuracy, report.forgetting
        );
        Ok(report)
    }

    /// Consume the trainer, returning the model and rehearsal state.
    pub fn into_parts(self) -> (M, Box<dyn Rehearsal>) {
        (self.model, self.rehearsal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{split_into_tasks, synthetic_blobs, BlobConfig};
    use crate::model::{IncrementalClassifier, ModelConfig};
    use crate::rehearsal::{build_rehearsal, RehearsalConfig, RehearsalKind};

    fn setup(n_epochs: usize) -> ContinualTrainer<IncrementalClassifier> {
        let (train, val) = synthetic_blobs(&BlobConfig {
            num_classes: 4,
            rows_per_class: 30,
            dim: 4,
            ..Default::default()
        });
        let tasks = split_into_tasks(&train, &val, &[0, 1, 2, 3], 2, 1).unwrap();
        let model = IncrementalClassifier::new(ModelConfig {
            initial_classes: 2,
            feature_dim: 4,
            batch_size: 16,
            patch_size: 2,
            embed_dim: 8,
            seed: 0,
        })
        .unwrap();
        let rehearsal = build_rehearsal(
            RehearsalConfig::new("unit")
                .kind(RehearsalKind::GaussianDistribution)
                .num_samples_per_class(5)
                .seed(Some(1)),
        )
        .unwrap();
        let config = TrainerConfig {
            n_epochs,
            batch_size: 16,
            shuffle_seed: Some(2),
            log_every: 0,
            ..Default::default()
        };
        ContinualTrainer::new(config, model, rehearsal, tasks).unwrap()
    }

    #[test]
    fn test_nan_feature_aborts_run_before_registration() {
        let mut trainer = setup(1);
        trainer.tasks.tasks[0].train.features[[3, 1]] = f64::NAN;

        let err = trainer.run().unwrap_err();
        assert!(matches!(
            err,
            RehearsalError::NonFiniteLoss { task_id: 0, epoch: 0, .. }
        ));
        assert!(trainer.rehearsal().is_empty());
        assert!(trainer.rehearsal().task_records().is_empty());
    }

    #[test]
    fn test_tasks_must_run_in_order() {
        let mut trainer = setup(1);
        assert!(trainer.prepare_task(1).is_err());
        trainer.run_task(0).unwrap();
        assert!(trainer.prepare_task(0).is_err());
        assert_eq!(trainer.next_task(), 1);
    }

    #[test]
    fn test_task_zero_is_not_augmented() {
        let mut trainer = setup(1);
        let prepared = trainer.prepare_task(0).unwrap();
        assert_eq!(prepared.synthetic_rows, 0);
        assert_eq!(prepared.real_rows, 60);
        assert_eq!(trainer.history(), &[TrainerPhase::TaskEntry(0)]);
    }

    #[test]
    fn test_phase_order_for_later_task() {
        let mut trainer = setup(1);
        trainer.run_task(0).unwrap();
        let start = trainer.history().len();
        let outcome = trainer.run_task(1).unwrap();

        assert_eq!(
            &trainer.history()[start..],
            &[
                TrainerPhase::TaskEntry(1),
                TrainerPhase::Expand(1),
                TrainerPhase::Freeze(1),
                TrainerPhase::RehearsalGenerate(1),
                TrainerPhase::Augment(1),
                TrainerPhase::Train { task_id: 1, epoch: 0 },
                TrainerPhase::EvaluateCumulative(1),
                TrainerPhase::RegisterTask(1),
            ]
        );
        // 30 real rows of class 2 plus 5 replayed rows for each of classes 0 and 1
        assert_eq!(outcome.real_rows, 30);
        assert_eq!(outcome.synthetic_rows, 10);
        assert_eq!(outcome.num_classes, 3);
        assert_eq!(outcome.evaluation.len(), 2);
    }

    #[test]
    fn test_run_covers_all_tasks() {
        let mut trainer = setup(2);
        let report = trainer.run().unwrap();
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(trainer.phase(), TrainerPhase::Finished);
        assert_eq!(report.accuracy_matrix.len(), 3);
        assert_eq!(report.accuracy_matrix[2].len(), 3);
        assert_eq!(trainer.rehearsal().class_ids(), vec![0, 1, 2, 3]);
        assert!(report.rehearsal_path.is_none());
        assert!((0.0..=1.0).contains(&report.final_accuracy()));
    }

    #[test]
    fn test_model_class_count_must_match_first_task() {
        let trainer = setup(1);
        let (model, rehearsal) = trainer.into_parts();
        let (train, val) = synthetic_blobs(&BlobConfig {
            num_classes: 3,
            rows_per_class: 10,
            dim: 4,
            ..Default::default()
        });
        let tasks = split_into_tasks(&train, &val, &[0, 1, 2], 3, 1).unwrap();
        assert!(ContinualTrainer::new(TrainerConfig::default(), model, rehearsal, tasks).is_err());
    }
}
