//! Running meters and continual-learning metrics.
//!
//! [`SmoothedValue`] and [`MetricLogger`] drive per-batch log lines.
//! [`ContinualLogger`] collects `(prediction, target, task_id)` records per
//! training step and derives accuracy, forgetting and backward transfer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::{RehearsalError, Result};

/// Windowed statistics of a scalar series plus a global average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    /// Record `value` observed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += value * n as f64;
        self.count += n;
    }

    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Most recent value.
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
    }
}

/// Named meters rendered into a single log line.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: &str) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.to_string(),
        }
    }

    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        self.meters
            .entry(name.to_string())
            .or_default()
            .update(value, n);
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Global average of `name`, zero if never updated.
    pub fn global_avg(&self, name: &str) -> f64 {
        self.meter(name).map(SmoothedValue::global_avg).unwrap_or(0.0)
    }

    /// Emit a progress line for batch `index` of `total`.
    pub fn log_batch(&self, header: &str, index: usize, total: usize) {
        tracing::info!("{} [{}/{}]{}{}", header, index, total, self.delimiter, self);
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{}: {}", name, meter))
            .collect();
        write!(f, "{}", parts.join(&self.delimiter))
    }
}

/// Which split a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subset {
    Train,
    Test,
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subset::Train => write!(f, "train"),
            Subset::Test => write!(f, "test"),
        }
    }
}

/// Receiver of per-sample prediction records.
pub trait MetricSink {
    /// Add aligned `(prediction, target, task_id)` triples.
    fn add(
        &mut self,
        predictions: &[usize],
        targets: &[usize],
        task_ids: &[usize],
        subset: Subset,
    ) -> Result<()>;

    /// Close the current training step.
    fn end_task(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    prediction: usize,
    target: usize,
    task_id: usize,
}

#[derive(Debug, Clone, Default)]
struct Step {
    train: Vec<Record>,
    test: Vec<Record>,
}

impl Step {
    fn records(&self, subset: Subset) -> &[Record] {
        match subset {
            Subset::Train => &self.train,
            Subset::Test => &self.test,
        }
    }
}

fn accuracy_of<'a>(records: impl Iterator<Item = &'a Record>) -> Option<f64> {
    let (hits, total) = records.fold((0usize, 0usize), |(h, t), r| {
        (h + usize::from(r.prediction == r.target), t + 1)
    });
    (total > 0).then(|| hits as f64 / total as f64)
}

/// Prediction records per training step, with continual-learning metrics.
///
/// Accuracies here are fractions in `[0, 1]`. Step `i` is the state after
/// training task `i`.
#[derive(Debug, Clone, Default)]
pub struct ContinualLogger {
    steps: Vec<Step>,
    current: Step,
}

impl ContinualLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed steps.
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Overall accuracy of the latest step.
    pub fn accuracy(&self, subset: Subset) -> f64 {
        self.last_step()
            .and_then(|s| accuracy_of(s.records(subset).iter()))
            .unwrap_or(0.0)
    }

    /// Accuracy per task id of the latest step, indexed by task id.
    pub fn accuracy_per_task(&self, subset: Subset) -> Vec<f64> {
        self.last_step()
            .map(|s| per_task(s.records(subset)))
            .unwrap_or_default()
    }

    /// Task ids present in the latest step, ascending.
    pub fn task_ids(&self, subset: Subset) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .last_step()
            .map(|s| s.records(subset).iter().map(|r| r.task_id).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Row `i` holds the test accuracy on tasks `0..=i` after step `i`.
    pub fn accuracy_matrix(&self) -> Vec<Vec<f64>> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let mut row = per_task(&step.test);
                row.resize(i + 1, 0.0);
                row
            })
            .collect()
    }

    /// Mean over steps of the overall test accuracy at that step.
    pub fn average_incremental_accuracy(&self) -> f64 {
        let accs: Vec<f64> = self
            .steps
            .iter()
            .filter_map(|s| accuracy_of(s.test.iter()))
            .collect();
        if accs.is_empty() {
            0.0
        } else {
            accs.iter().sum::<f64>() / accs.len() as f64
        }
    }

    /// Mean drop from the best earlier accuracy to the final accuracy over
    /// all tasks but the last. Zero with fewer than two steps.
    pub fn forgetting(&self) -> f64 {
        let matrix = self.accuracy_matrix();
        let last = match matrix.len() {
            0 | 1 => return 0.0,
            n => n - 1,
        };
        let drops: Vec<f64> = (0..last)
            .map(|task| {
                let best = (task..last)
                    .map(|step| matrix[step][task])
                    .fold(f64::NEG_INFINITY, f64::max);
                best - matrix[last][task]
            })
            .collect();
        drops.iter().sum::<f64>() / drops.len() as f64
    }

    /// Mean of final accuracy minus accuracy right after learning, over all
    /// tasks but the last. Negative values mean forgetting.
    pub fn backward_transfer(&self) -> f64 {
        let matrix = self.accuracy_matrix();
        let last = match matrix.len() {
            0 | 1 => return 0.0,
            n => n - 1,
        };
        (0..last)
            .map(|task| matrix[last][task] - matrix[task][task])
            .sum::<f64>()
            / last as f64
    }
}

fn per_task(records: &[Record]) -> Vec<f64> {
    let num_tasks = records.iter().map(|r| r.task_id + 1).max().unwrap_or(0);
    (0..num_tasks)
        .map(|task| accuracy_of(records.iter().filter(|r| r.task_id == task)).unwrap_or(0.0))
        .collect()
}

impl MetricSink for ContinualLogger {
    fn add(
        &mut self,
        predictions: &[usize],
        targets: &[usize],
        task_ids: &[usize],
        subset: Subset,
    ) -> Result<()> {
        if predictions.len() != targets.len() || targets.len() != task_ids.len() {
            return Err(RehearsalError::Data(format!(
                "metric record lengths differ: {} predictions, {} targets, {} task ids",
                predictions.len(),
                targets.len(),
                task_ids.len()
            )));
        }
        let records = predictions
            .iter()
            .zip(targets)
            .zip(task_ids)
            .map(|((&prediction, &target), &task_id)| Record {
                prediction,
                target,
                task_id,
            });
        match subset {
            Subset::Train => self.current.train.extend(records),
            Subset::Test => self.current.test.extend(records),
        }
        Ok(())
    }

    fn end_task(&mut self) {
        self.steps.push(std::mem::take(&mut self.current));
    }
}
