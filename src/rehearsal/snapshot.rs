//! Versioned, variant-tagged serialized layout of the rehearsal state.
//!
//! Parameters are stored as plain nested vectors so the on-disk format does
//! not depend on any in-memory array representation.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::RehearsalKind;
use crate::utils::{load_json, save_json};
use crate::{ClassId, RehearsalError, Result};

/// Layout version written by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Parameters of one class distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistributionRecord {
    Gaussian {
        mean: Vec<f64>,
        covariance: Vec<Vec<f64>>,
    },
    Mixture {
        n_components: usize,
        weights: Vec<f64>,
        means: Vec<Vec<f64>>,
        covariances: Vec<Vec<Vec<f64>>>,
        bic: f64,
        n_iter: usize,
    },
}

impl DistributionRecord {
    /// Tag used in the serialized form.
    pub fn type_name(&self) -> &'static str {
        match self {
            DistributionRecord::Gaussian { .. } => "gaussian",
            DistributionRecord::Mixture { .. } => "mixture",
        }
    }
}

/// One stored class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSnapshot {
    pub class_id: ClassId,
    pub record: DistributionRecord,
}

/// Whole rehearsal state, classes in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RehearsalSnapshot {
    pub version: u32,
    pub kind: RehearsalKind,
    pub classes: Vec<ClassSnapshot>,
}

impl RehearsalSnapshot {
    /// Empty snapshot of the current version.
    pub fn new(kind: RehearsalKind) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            kind,
            classes: Vec::new(),
        }
    }

    /// Class ids in stored order.
    pub fn class_ids(&self) -> Vec<ClassId> {
        self.classes.iter().map(|c| c.class_id).collect()
    }

    /// Check version, variant tag and class id uniqueness.
    pub fn check(&self, expected: RehearsalKind) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(RehearsalError::SnapshotMismatch(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        if self.kind != expected {
            return Err(RehearsalError::SnapshotMismatch(format!(
                "snapshot holds {} state, store is {}",
                self.kind, expected
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for class in &self.classes {
            if !seen.insert(class.class_id) {
                return Err(RehearsalError::SnapshotMismatch(format!(
                    "class {} appears twice",
                    class.class_id
                )));
            }
        }
        Ok(())
    }

    /// Write the snapshot as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path)
    }

    /// Read a snapshot written by [`RehearsalSnapshot::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path)
    }
}

/// Row-major nested vectors from a matrix.
pub fn matrix_to_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}

/// Matrix from row-major nested vectors; all rows must have equal length.
pub fn rows_to_matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != ncols) {
        return Err(RehearsalError::SnapshotMismatch(
            "ragged matrix rows".to_string(),
        ));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), ncols), flat)
        .map_err(|e| RehearsalError::SnapshotMismatch(e.to_string()))
}
