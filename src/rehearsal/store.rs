//! Insertion-ordered rehearsal state, generic over the density model.

use chrono::Utc;
use cpu_time::ProcessTime;
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::snapshot::{ClassSnapshot, DistributionRecord, RehearsalSnapshot};
use super::{
    ClassRecord, Rehearsal, RehearsalConfig, RehearsalKind, TaskRecord, TaskRegistration,
};
use crate::data::TaskData;
use crate::{ClassId, RehearsalError, Result};

/// Fits, samples and (de)serializes one kind of class density.
pub trait DistributionFitter: Send {
    type Model: Clone + Debug + Send;

    fn kind(&self) -> RehearsalKind;

    /// Fit a model to the rows of `features`.
    fn fit(&self, class_id: ClassId, features: ArrayView2<f64>, rng: &mut StdRng)
        -> Result<Self::Model>;

    /// Draw `n` rows from `model`.
    fn sample(&self, model: &Self::Model, n: usize, rng: &mut StdRng) -> Result<Array2<f64>>;

    /// Feature dimension of `model`.
    fn dim(&self, model: &Self::Model) -> usize;

    fn to_record(&self, model: &Self::Model) -> DistributionRecord;

    fn from_record(&self, class_id: ClassId, record: &DistributionRecord) -> Result<Self::Model>;
}

#[derive(Debug, Clone)]
struct ClassEntry<M> {
    class_id: ClassId,
    model: M,
}

/// Rehearsal state for one strategy.
///
/// Entries keep the order in which classes were first stored; refitting a
/// class replaces its model in place.
#[derive(Debug)]
pub struct RehearsalStore<F: DistributionFitter> {
    fitter: F,
    config: RehearsalConfig,
    entries: Vec<ClassEntry<F::Model>>,
    uncovered: Vec<ClassId>,
    task_records: Vec<TaskRecord>,
    class_records: Vec<ClassRecord>,
    next_task_index: usize,
    rng: StdRng,
}

impl<F: DistributionFitter> RehearsalStore<F> {
    pub fn new(fitter: F, config: RehearsalConfig) -> Result<Self> {
        config.validate()?;
        if fitter.kind() != config.kind {
            return Err(RehearsalError::InvalidConfig(format!(
                "config asks for {} but the fitter is {}",
                config.kind,
                fitter.kind()
            )));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            fitter,
            config,
            entries: Vec::new(),
            uncovered: Vec::new(),
            task_records: Vec::new(),
            class_records: Vec::new(),
            next_task_index: 0,
            rng,
        })
    }

    /// Index the next registered task receives.
    pub fn next_task_index(&self) -> usize {
        self.next_task_index
    }

    /// Fitted model for `class_id`.
    pub fn model(&self, class_id: ClassId) -> Option<&F::Model> {
        self.entries
            .iter()
            .find(|e| e.class_id == class_id)
            .map(|e| &e.model)
    }

    pub fn fitter(&self) -> &F {
        &self.fitter
    }

    fn stored_dim(&self) -> Option<usize> {
        self.entries.first().map(|e| self.fitter.dim(&e.model))
    }

    fn insert(&mut self, class_id: ClassId, model: F::Model) {
        match self.entries.iter_mut().find(|e| e.class_id == class_id) {
            Some(entry) => entry.model = model,
            None => self.entries.push(ClassEntry { class_id, model }),
        }
        self.uncovered.retain(|&c| c != class_id);
    }

    fn flag_uncovered(&mut self, class_id: ClassId) {
        if !self.uncovered.contains(&class_id) {
            self.uncovered.push(class_id);
        }
    }

    fn record_class(&mut self, record: ClassRecord) {
        match self
            .class_records
            .iter_mut()
            .find(|r| r.class_id == record.class_id)
        {
            Some(existing) => *existing = record,
            None => self.class_records.push(record),
        }
    }
}

/// Process CPU time since `start`; zero when the clock could not be read.
fn cpu_since(start: Option<ProcessTime>) -> Duration {
    start
        .and_then(|t| t.try_elapsed().ok())
        .unwrap_or_default()
}

impl<F: DistributionFitter> Rehearsal for RehearsalStore<F> {
    fn kind(&self) -> RehearsalKind {
        self.fitter.kind()
    }

    fn config(&self) -> &RehearsalConfig {
        &self.config
    }

    fn register_task(&mut self, task: &TaskData) -> Result<TaskRegistration> {
        task.validate()?;

        let task_index = self.next_task_index;
        let started_at = Utc::now();
        let task_cpu = ProcessTime::try_now().ok();

        let mut fitted = Vec::new();
        let mut uncovered = Vec::new();

        for class_id in task.classes() {
            let class_cpu = ProcessTime::try_now().ok();
            let class_start = Instant::now();
            let rows = task.class_rows(class_id);

            match self.fit_class(class_id, rows.view()) {
                Ok(()) => fitted.push(class_id),
                Err(e) if e.is_class_local() => {
                    warn!("Class {} has no rehearsal coverage: {}", class_id, e);
                    uncovered.push(class_id);
                }
                Err(e) => return Err(e),
            }

            self.record_class(ClassRecord {
                class_id,
                task_index,
                processing: cpu_since(class_cpu),
                wall_clock: class_start.elapsed(),
            });
        }

        let record = TaskRecord {
            task_index,
            started_at,
            finished_at: Utc::now(),
            processing: cpu_since(task_cpu),
        };
        info!(
            "Registered task {}: {} classes fitted, {} uncovered, cpu {:.3}s, wall {:.3}s",
            task_index,
            fitted.len(),
            uncovered.len(),
            record.processing.as_secs_f64(),
            record.wall_clock().num_milliseconds() as f64 / 1000.0
        );
        self.task_records.push(record);
        self.next_task_index += 1;

        Ok(TaskRegistration {
            task_index,
            fitted,
            uncovered,
        })
    }

    fn fit_class(&mut self, class_id: ClassId, features: ArrayView2<f64>) -> Result<()> {
        if let Some(dim) = self.stored_dim() {
            if features.ncols() != dim {
                return Err(RehearsalError::Data(format!(
                    "class {} has {} features, stored classes have {}",
                    class_id,
                    features.ncols(),
                    dim
                )));
            }
        }

        match self.fitter.fit(class_id, features, &mut self.rng) {
            Ok(model) => {
                debug!("Fitted class {} on {} rows", class_id, features.nrows());
                self.insert(class_id, model);
                Ok(())
            }
            Err(e) => {
                if e.is_class_local() {
                    self.flag_uncovered(class_id);
                }
                Err(e)
            }
        }
    }

    fn generate(&mut self, n_per_class: usize) -> Result<TaskData> {
        if n_per_class == 0 {
            return Err(RehearsalError::InvalidConfig(
                "n_per_class must be at least 1".to_string(),
            ));
        }
        let dim = match self.stored_dim() {
            Some(dim) => dim,
            None => return Ok(TaskData::empty(0)),
        };

        let total = n_per_class * self.entries.len();
        let mut features = Array2::zeros((total, dim));
        let mut labels = Vec::with_capacity(total);

        for (block, entry) in self.entries.iter().enumerate() {
            let samples = self.fitter.sample(&entry.model, n_per_class, &mut self.rng)?;
            let start = block * n_per_class;
            features
                .slice_mut(ndarray::s![start..start + n_per_class, ..])
                .assign(&samples);
            labels.extend(std::iter::repeat(entry.class_id).take(n_per_class));
        }

        debug!(
            "Generated {} rehearsal rows for {} classes",
            total,
            self.entries.len()
        );
        TaskData::new(features, labels)
    }

    fn class_ids(&self) -> Vec<ClassId> {
        self.entries.iter().map(|e| e.class_id).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn uncovered_classes(&self) -> &[ClassId] {
        &self.uncovered
    }

    fn task_records(&self) -> &[TaskRecord] {
        &self.task_records
    }

    fn class_records(&self) -> &[ClassRecord] {
        &self.class_records
    }

    fn snapshot(&self) -> RehearsalSnapshot {
        let mut snapshot = RehearsalSnapshot::new(self.kind());
        snapshot.classes = self
            .entries
            .iter()
            .map(|e| ClassSnapshot {
                class_id: e.class_id,
                record: self.fitter.to_record(&e.model),
            })
            .collect();
        snapshot
    }

    fn restore(&mut self, snapshot: &RehearsalSnapshot) -> Result<()> {
        snapshot.check(self.kind())?;

        let mut entries = Vec::with_capacity(snapshot.classes.len());
        let mut dim = None;
        for class in &snapshot.classes {
            let model = self.fitter.from_record(class.class_id, &class.record)?;
            let model_dim = self.fitter.dim(&model);
            if *dim.get_or_insert(model_dim) != model_dim {
                return Err(RehearsalError::SnapshotMismatch(format!(
                    "class {} has dimension {}, earlier classes have {}",
                    class.class_id,
                    model_dim,
                    dim.unwrap_or(0)
                )));
            }
            entries.push(ClassEntry {
                class_id: class.class_id,
                model,
            });
        }

        self.entries = entries;
        // Classes the snapshot covers regain coverage; the rest stay flagged
        self.uncovered
            .retain(|&c| snapshot.classes.iter().all(|class| class.class_id != c));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rehearsal::{GaussianFitter, MixtureFitter};
    use rand::Rng;
    use rand_distr::StandardNormal;

    fn blob_task(classes: &[ClassId], rows: usize, dim: usize, seed: u64) -> TaskData {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut features = Array2::zeros((rows * classes.len(), dim));
        let mut labels = Vec::new();
        for (c, &class_id) in classes.iter().enumerate() {
            for i in 0..rows {
                for j in 0..dim {
                    let z: f64 = rng.sample(StandardNormal);
                    features[[c * rows + i, j]] = 4.0 * class_id as f64 + z;
                }
                labels.push(class_id);
            }
        }
        TaskData::new(features, labels).unwrap()
    }

    fn gaussian_store() -> RehearsalStore<GaussianFitter> {
        let config = RehearsalConfig::new("test")
            .kind(RehearsalKind::GaussianDistribution)
            .seed(Some(3));
        RehearsalStore::new(GaussianFitter::new(), config).unwrap()
    }

    #[test]
    fn test_register_stores_exactly_task_classes() {
        let mut store = gaussian_store();
        let reg = store.register_task(&blob_task(&[0, 1], 10, 4, 0)).unwrap();
        assert_eq!(reg.task_index, 0);
        assert_eq!(reg.fitted, vec![0, 1]);
        assert!(reg.uncovered.is_empty());
        assert_eq!(store.class_ids(), vec![0, 1]);
        assert_eq!(store.class_records().len(), 2);
    }

    #[test]
    fn test_task_index_counts_registrations() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[0], 10, 2, 0)).unwrap();
        // Re-registering the same class is a new logical task
        store.register_task(&blob_task(&[0], 10, 2, 1)).unwrap();
        store.register_task(&blob_task(&[5], 10, 2, 2)).unwrap();

        let indices: Vec<usize> = store.task_records().iter().map(|r| r.task_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(store.next_task_index(), 3);
        assert_eq!(store.class_ids(), vec![0, 5]);
        // Class records stay keyed by class
        assert_eq!(store.class_records().len(), 2);
        assert_eq!(store.class_records()[0].task_index, 1);
    }

    #[test]
    fn test_refit_keeps_insertion_position() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[2, 0], 10, 2, 0)).unwrap();
        store.register_task(&blob_task(&[1], 10, 2, 1)).unwrap();
        let before = store.model(0).unwrap().mean.clone();

        store.register_task(&blob_task(&[0], 10, 2, 9)).unwrap();
        assert_eq!(store.class_ids(), vec![0, 2, 1]);
        assert_ne!(store.model(0).unwrap().mean, before);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut store = gaussian_store();
        let bad = TaskData {
            features: Array2::zeros((4, 2)),
            labels: vec![0, 0, 0],
        };
        assert!(matches!(
            store.register_task(&bad),
            Err(RehearsalError::ShapeMismatch { features: 4, labels: 3 })
        ));
        assert!(store.task_records().is_empty());
        assert_eq!(store.next_task_index(), 0);
    }

    #[test]
    fn test_degenerate_class_is_flagged_not_fatal() {
        let mut store = gaussian_store();
        // Class 7 has 2 rows in 4 dimensions
        let good = blob_task(&[0], 10, 4, 0);
        let thin = blob_task(&[7], 2, 4, 1);
        let task = good.concat(&thin).unwrap();

        let reg = store.register_task(&task).unwrap();
        assert_eq!(reg.fitted, vec![0]);
        assert_eq!(reg.uncovered, vec![7]);
        assert_eq!(store.uncovered_classes(), &[7]);
        assert_eq!(store.class_ids(), vec![0]);

        // A later successful fit clears the flag
        store.register_task(&blob_task(&[7], 12, 4, 2)).unwrap();
        assert!(store.uncovered_classes().is_empty());
        assert_eq!(store.class_ids(), vec![0, 7]);
    }

    #[test]
    fn test_failed_refit_keeps_previous_record() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[0], 10, 3, 0)).unwrap();
        let mean = store.model(0).unwrap().mean.clone();

        let reg = store.register_task(&blob_task(&[0], 2, 3, 1)).unwrap();
        assert_eq!(reg.uncovered, vec![0]);
        assert_eq!(store.model(0).unwrap().mean, mean);
        assert_eq!(store.uncovered_classes(), &[0]);
    }

    #[test]
    fn test_generate_blocks_in_insertion_order() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[2, 0], 10, 3, 0)).unwrap();
        store.register_task(&blob_task(&[1], 10, 3, 1)).unwrap();

        let replay = store.generate(4).unwrap();
        assert_eq!(replay.features.dim(), (12, 3));
        assert_eq!(replay.labels, vec![0, 0, 0, 0, 2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn test_generate_empty_and_zero() {
        let mut store = gaussian_store();
        let replay = store.generate(5).unwrap();
        assert!(replay.is_empty());
        assert!(matches!(
            store.generate(0),
            Err(RehearsalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_dimension_change_is_rejected() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[0], 10, 3, 0)).unwrap();
        assert!(matches!(
            store.register_task(&blob_task(&[1], 10, 2, 1)),
            Err(RehearsalError::Data(_))
        ));
    }

    #[test]
    fn test_restore_rejects_other_kind() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[0], 10, 2, 0)).unwrap();
        let mut snapshot = store.snapshot();
        snapshot.kind = RehearsalKind::GaussianMixtureModel;
        assert!(store.restore(&snapshot).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_restore_keeps_flags_for_classes_it_does_not_cover() {
        let mut source = gaussian_store();
        source.register_task(&blob_task(&[0, 1], 10, 3, 0)).unwrap();
        let snapshot = source.snapshot();

        let mut store = gaussian_store();
        // Classes 1 and 6 are too thin to fit in 3 dimensions
        let task = blob_task(&[1], 2, 3, 1).concat(&blob_task(&[6], 2, 3, 2)).unwrap();
        store.register_task(&task).unwrap();
        assert_eq!(store.uncovered_classes(), &[1, 6]);

        store.restore(&snapshot).unwrap();
        assert_eq!(store.class_ids(), vec![0, 1]);
        assert_eq!(store.uncovered_classes(), &[6]);
    }

    #[test]
    fn test_registration_records_cpu_and_wall_time() {
        let mut store = gaussian_store();
        store.register_task(&blob_task(&[0, 1], 2000, 8, 0)).unwrap();

        let task = &store.task_records()[0];
        assert!(task.finished_at >= task.started_at);
        assert!(task.wall_clock() >= chrono::Duration::zero());
        assert!(task.processing > Duration::ZERO);

        assert_eq!(store.class_records().len(), 2);
        for record in store.class_records() {
            assert_eq!(record.task_index, 0);
            // Class intervals nest inside the task interval
            assert!(record.processing <= task.processing);
            assert!(record.wall_clock > Duration::ZERO);
        }
    }

    #[test]
    fn test_kind_must_match_fitter() {
        let config = RehearsalConfig::new("x").kind(RehearsalKind::GaussianDistribution);
        let fitter = MixtureFitter::new(vec![2], Some(0), Default::default());
        assert!(RehearsalStore::new(fitter, config).is_err());
    }

    #[test]
    fn test_mixture_snapshot_restores_parameters() {
        let config = RehearsalConfig::new("mix").components_range(vec![1, 2]).seed(Some(5));
        let fitter = MixtureFitter::new(vec![1, 2], Some(5), Default::default());
        let mut store = RehearsalStore::new(fitter.clone(), config.clone()).unwrap();
        store.register_task(&blob_task(&[0, 1], 40, 2, 0)).unwrap();

        let snapshot = store.snapshot();
        let mut restored = RehearsalStore::new(fitter, config).unwrap();
        restored.restore(&snapshot).unwrap();

        assert_eq!(restored.class_ids(), store.class_ids());
        for class_id in [0, 1] {
            let a = store.model(class_id).unwrap();
            let b = restored.model(class_id).unwrap();
            assert_eq!(a.n_components(), b.n_components());
            assert_eq!(a.weights, b.weights);
        }
        assert_eq!(restored.snapshot(), snapshot);
    }
}
