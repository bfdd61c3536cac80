//! Generative pseudo-rehearsal.
//!
//! A compact density model is fitted to every class as its task is
//! registered. Later tasks replay earlier classes by sampling from those
//! models instead of storing raw exemplars.
//!
//! - [`GaussianFitter`]: one multivariate Gaussian per class
//! - [`MixtureFitter`]: Gaussian mixture per class, component count chosen by BIC
//! - [`RehearsalStore`]: insertion-ordered class state generic over the fitter
//! - [`RehearsalSnapshot`]: versioned persisted layout

mod gaussian;
pub mod linalg;
mod mixture;
mod snapshot;
mod store;

pub use gaussian::{GaussianFitter, MultivariateGaussian};
pub use mixture::{EmConfig, GaussianMixture, MixtureFitter};
pub use snapshot::{
    matrix_to_rows, rows_to_matrix, ClassSnapshot, DistributionRecord, RehearsalSnapshot,
    SNAPSHOT_VERSION,
};
pub use store::{DistributionFitter, RehearsalStore};

use chrono::{DateTime, Utc};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::data::TaskData;
use crate::{ClassId, RehearsalError, Result};

/// Closed set of rehearsal strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RehearsalKind {
    /// One multivariate Gaussian per class.
    GaussianDistribution,
    /// Gaussian mixture per class with BIC model selection.
    #[default]
    GaussianMixtureModel,
}

impl fmt::Display for RehearsalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RehearsalKind::GaussianDistribution => write!(f, "GaussianDistribution"),
            RehearsalKind::GaussianMixtureModel => write!(f, "GaussianMixtureModel"),
        }
    }
}

impl FromStr for RehearsalKind {
    type Err = RehearsalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "gaussiandistribution" | "gaussian" => Ok(RehearsalKind::GaussianDistribution),
            "gaussianmixturemodel" | "gmm" | "mixture" => Ok(RehearsalKind::GaussianMixtureModel),
            other => Err(RehearsalError::InvalidConfig(format!(
                "unknown rehearsal kind: {}",
                other
            ))),
        }
    }
}

/// Rehearsal settings. Built by name, never positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RehearsalConfig {
    /// Which strategy [`build_rehearsal`] constructs.
    pub kind: RehearsalKind,
    /// Keys the persisted state location.
    pub dataset_name: String,
    /// Synthetic rows generated per stored class during training.
    pub num_samples_per_class: usize,
    /// Mixture component counts tried, in tie-break order.
    pub components_range: Vec<usize>,
    /// Seed for fitting and sampling; entropy when absent.
    pub seed: Option<u64>,
    /// Root directory for persisted state.
    pub save_dir: PathBuf,
    /// EM settings for the mixture strategy.
    pub mixture: EmConfig,
}

impl Default for RehearsalConfig {
    fn default() -> Self {
        Self {
            kind: RehearsalKind::default(),
            dataset_name: "default".to_string(),
            num_samples_per_class: 10,
            components_range: vec![2, 3, 4],
            seed: None,
            save_dir: PathBuf::from("saves"),
            mixture: EmConfig::default(),
        }
    }
}

impl RehearsalConfig {
    pub fn new(dataset_name: impl Into<String>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: RehearsalKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn num_samples_per_class(mut self, n: usize) -> Self {
        self.num_samples_per_class = n;
        self
    }

    pub fn components_range(mut self, range: Vec<usize>) -> Self {
        self.components_range = range;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = dir.into();
        self
    }

    pub fn mixture(mut self, em: EmConfig) -> Self {
        self.mixture = em;
        self
    }

    /// `save_dir/dataset_name/rehearsal_data.json`
    pub fn save_path(&self) -> PathBuf {
        self.save_dir
            .join(&self.dataset_name)
            .join("rehearsal_data.json")
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_samples_per_class == 0 {
            return Err(RehearsalError::InvalidConfig(
                "num_samples_per_class must be at least 1".to_string(),
            ));
        }
        if self.components_range.is_empty() {
            return Err(RehearsalError::InvalidConfig(
                "components_range must not be empty".to_string(),
            ));
        }
        if self.components_range.iter().any(|&k| k == 0) {
            return Err(RehearsalError::InvalidConfig(
                "components_range entries must be at least 1".to_string(),
            ));
        }
        if self.dataset_name.is_empty() {
            return Err(RehearsalError::InvalidConfig(
                "dataset_name must not be empty".to_string(),
            ));
        }
        if self.mixture.max_iter == 0 || !(self.mixture.tol > 0.0) || self.mixture.reg_covar < 0.0 {
            return Err(RehearsalError::InvalidConfig(
                "mixture needs max_iter >= 1, tol > 0 and reg_covar >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of [`Rehearsal::register_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRegistration {
    pub task_index: usize,
    /// Classes whose record was stored or replaced.
    pub fitted: Vec<ClassId>,
    /// Classes whose fit failed during this registration.
    pub uncovered: Vec<ClassId>,
}

/// Timing of one task registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_index: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// CPU time consumed by the process while fitting the task.
    pub processing: Duration,
}

impl TaskRecord {
    /// Wall-clock time between start and finish.
    pub fn wall_clock(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Timing of the latest fit of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub class_id: ClassId,
    pub task_index: usize,
    /// CPU time consumed by the process while fitting the class.
    pub processing: Duration,
    pub wall_clock: Duration,
}

/// Rehearsal strategy as seen by the trainer.
pub trait Rehearsal: Send {
    fn kind(&self) -> RehearsalKind;

    fn config(&self) -> &RehearsalConfig;

    /// Fit every class present in `task` and record timing.
    ///
    /// Per-class fit failures are logged and reported in the returned
    /// [`TaskRegistration`]; they flag the class as uncovered instead of
    /// aborting. A feature/label row mismatch fails immediately.
    fn register_task(&mut self, task: &TaskData) -> Result<TaskRegistration>;

    /// Fit and store one class, replacing any previous record on success.
    fn fit_class(&mut self, class_id: ClassId, features: ArrayView2<f64>) -> Result<()>;

    /// `n_per_class` synthetic rows for every stored class, blocked in
    /// insertion order. Empty when nothing is stored.
    fn generate(&mut self, n_per_class: usize) -> Result<TaskData>;

    /// Stored class ids in insertion order.
    fn class_ids(&self) -> Vec<ClassId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classes whose latest fit failed, in the order they were flagged.
    fn uncovered_classes(&self) -> &[ClassId];

    fn task_records(&self) -> &[TaskRecord];

    fn class_records(&self) -> &[ClassRecord];

    fn snapshot(&self) -> RehearsalSnapshot;

    /// Replace the stored state with `snapshot`. Nothing changes on error.
    fn restore(&mut self, snapshot: &RehearsalSnapshot) -> Result<()>;

    /// Persist to `path`.
    fn save_to(&self, path: &Path) -> Result<()> {
        self.snapshot().save(path)?;
        tracing::info!("Saved {} rehearsal classes to {}", self.len(), path.display());
        Ok(())
    }

    /// Restore from `path`.
    fn load_from(&mut self, path: &Path) -> Result<()> {
        let snapshot = RehearsalSnapshot::load(path)?;
        self.restore(&snapshot)?;
        tracing::info!("Loaded {} rehearsal classes from {}", self.len(), path.display());
        Ok(())
    }

    /// Persist to the configured save path and return it.
    fn save(&self) -> Result<PathBuf> {
        let path = self.config().save_path();
        self.save_to(&path)?;
        Ok(path)
    }

    /// Restore from the configured save path.
    fn load(&mut self) -> Result<()> {
        let path = self.config().save_path();
        self.load_from(&path)
    }
}

/// Construct the strategy named by `config.kind`.
pub fn build_rehearsal(config: RehearsalConfig) -> Result<Box<dyn Rehearsal>> {
    config.validate()?;
    Ok(match config.kind {
        RehearsalKind::GaussianDistribution => {
            Box::new(RehearsalStore::new(GaussianFitter::new(), config)?)
        }
        RehearsalKind::GaussianMixtureModel => {
            let fitter = MixtureFitter::new(
                config.components_range.clone(),
                config.seed,
                config.mixture.clone(),
            );
            Box::new(RehearsalStore::new(fitter, config)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(
            "GaussianDistribution".parse::<RehearsalKind>().unwrap(),
            RehearsalKind::GaussianDistribution
        );
        assert_eq!(
            "gmm".parse::<RehearsalKind>().unwrap(),
            RehearsalKind::GaussianMixtureModel
        );
        assert!("kde".parse::<RehearsalKind>().is_err());
    }

    #[test]
    fn test_config_defaults_and_path() {
        let config = RehearsalConfig::new("har").save_dir("/tmp/runs");
        assert_eq!(config.num_samples_per_class, 10);
        assert_eq!(config.components_range, vec![2, 3, 4]);
        assert_eq!(
            config.save_path(),
            PathBuf::from("/tmp/runs/har/rehearsal_data.json")
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(RehearsalConfig::new("x").validate().is_ok());
        assert!(RehearsalConfig::new("x").num_samples_per_class(0).validate().is_err());
        assert!(RehearsalConfig::new("x").components_range(vec![]).validate().is_err());
        assert!(RehearsalConfig::new("x").components_range(vec![2, 0]).validate().is_err());
    }

    #[test]
    fn test_build_dispatches_on_kind() {
        let gaussian = build_rehearsal(
            RehearsalConfig::new("x").kind(RehearsalKind::GaussianDistribution),
        )
        .unwrap();
        assert_eq!(gaussian.kind(), RehearsalKind::GaussianDistribution);
        assert!(gaussian.is_empty());

        let mixture = build_rehearsal(RehearsalConfig::new("x").seed(Some(1))).unwrap();
        assert_eq!(mixture.kind(), RehearsalKind::GaussianMixtureModel);

        assert!(build_rehearsal(RehearsalConfig::new("x").num_samples_per_class(0)).is_err());
    }
}
