//! Inference-only evaluation over every task seen so far.

use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

use super::losses::{accuracy, argmax_rows, cross_entropy, top_k};
use super::metrics::{MetricLogger, MetricSink, Subset};
use crate::data::{DataLoader, TaskData};
use crate::model::ExpandableModel;
use crate::Result;

/// Result of evaluating one task's validation split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEval {
    pub task_id: usize,
    pub samples: usize,
    pub loss: f64,
    /// Top-1 accuracy in percent.
    pub acc1: f64,
    /// Top-k accuracy in percent.
    pub acck: f64,
    pub k: usize,
}

/// Runs forward passes over validation splits and feeds a [`MetricSink`].
#[derive(Debug, Clone)]
pub struct Evaluator {
    batch_size: usize,
    log_every: usize,
}

impl Evaluator {
    pub fn new(batch_size: usize, log_every: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            log_every,
        }
    }

    /// Evaluate `model` on `val_sets[t]` for every task `t`.
    ///
    /// Every validation row produces one `(prediction, target, t)` record
    /// under [`Subset::Test`]; no trailing batch is dropped.
    pub fn evaluate<M: ExpandableModel + ?Sized>(
        &self,
        model: &M,
        val_sets: &[&TaskData],
        sink: &mut dyn MetricSink,
    ) -> Result<Vec<TaskEval>> {
        let k = top_k(model.num_classes());
        let mut results = Vec::with_capacity(val_sets.len());

        for (task_id, data) in val_sets.iter().enumerate() {
            let start = Instant::now();
            let mut meters = MetricLogger::default();
            let loader = DataLoader::new(data.len(), self.batch_size);
            let num_batches = loader.num_batches();

            for (batch_index, indices) in loader.enumerate() {
                let x = data.features.select(Axis(0), &indices);
                let targets: Vec<usize> = indices.iter().map(|&i| data.labels[i]).collect();

                let logits = model.forward(x.view())?;
                let (loss, _) = cross_entropy(logits.view(), &targets)?;
                let acc1 = accuracy(logits.view(), &targets, 1)?;
                let acck = accuracy(logits.view(), &targets, k)?;

                let n = targets.len();
                meters.update("loss", loss, n);
                meters.update("acc1", acc1, n);
                meters.update("acck", acck, n);

                let predictions = argmax_rows(logits.view());
                sink.add(&predictions, &targets, &vec![task_id; n], Subset::Test)?;

                if self.log_every > 0 && batch_index % self.log_every == 0 {
                    meters.log_batch(&format!("Test: [task {}]", task_id), batch_index, num_batches);
                }
            }

            let eval = TaskEval {
                task_id,
                samples: data.len(),
                loss: meters.global_avg("loss"),
                acc1: meters.global_avg("acc1"),
                acck: meters.global_avg("acck"),
                k,
            };
            info!(
                "Test task {}: loss {:.4}  acc1 {:.2}  acc{} {:.2}  ({} rows, {:.3}s)",
                task_id,
                eval.loss,
                eval.acc1,
                k,
                eval.acck,
                eval.samples,
                start.elapsed().as_secs_f64()
            );
            results.push(eval);
        }

        Ok(results)
    }
}
