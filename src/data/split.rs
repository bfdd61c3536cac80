//! Building class-incremental task sequences.

use std::collections::HashMap;
use std::path::Path;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::task::{TaskData, TaskSequence, TaskSplit};
use crate::{ClassId, RehearsalError, Result};

/// Group a flat data set into tasks.
///
/// The first `base_increment` classes of `class_order` form task 0, every
/// following group of `increment` classes forms one further task. Labels are
/// remapped to their position in `class_order`, so task `k` always owns a
/// contiguous block of label indices.
pub fn split_into_tasks(
    train: &TaskData,
    val: &TaskData,
    class_order: &[ClassId],
    base_increment: usize,
    increment: usize,
) -> Result<TaskSequence> {
    train.validate()?;
    val.validate()?;

    if base_increment == 0 || increment == 0 {
        return Err(RehearsalError::InvalidConfig(
            "base_increment and increment must be at least 1".to_string(),
        ));
    }

    let mut position: HashMap<ClassId, usize> = HashMap::with_capacity(class_order.len());
    for (idx, &class_id) in class_order.iter().enumerate() {
        if position.insert(class_id, idx).is_some() {
            return Err(RehearsalError::Data(format!(
                "class {} appears twice in class order",
                class_id
            )));
        }
    }

    let mut classes_per_task = vec![base_increment.min(class_order.len())];
    let mut assigned = classes_per_task[0];
    while assigned < class_order.len() {
        let size = increment.min(class_order.len() - assigned);
        classes_per_task.push(size);
        assigned += size;
    }

    let mut bounds = Vec::with_capacity(classes_per_task.len());
    let mut start = 0;
    for &size in &classes_per_task {
        bounds.push(start..start + size);
        start += size;
    }

    let remap = |data: &TaskData| -> Result<Vec<(usize, ClassId)>> {
        data.labels
            .iter()
            .enumerate()
            .map(|(row, label)| {
                position.get(label).map(|&new| (row, new)).ok_or_else(|| {
                    RehearsalError::Data(format!("label {} missing from class order", label))
                })
            })
            .collect()
    };
    let train_rows = remap(train)?;
    let val_rows = remap(val)?;

    let select = |data: &TaskData, rows: &[(usize, ClassId)], range: &std::ops::Range<usize>| {
        let picked: Vec<(usize, ClassId)> = rows
            .iter()
            .copied()
            .filter(|(_, label)| range.contains(label))
            .collect();
        let indices: Vec<usize> = picked.iter().map(|(row, _)| *row).collect();
        let mut subset = data.subset(&indices);
        subset.labels = picked.into_iter().map(|(_, label)| label).collect();
        subset
    };

    let tasks = bounds
        .iter()
        .map(|range| TaskSplit {
            train: select(train, &train_rows, range),
            val: select(val, &val_rows, range),
        })
        .collect();

    Ok(TaskSequence {
        tasks,
        class_order: class_order.to_vec(),
        classes_per_task,
    })
}

/// Read `f1,...,fD,label` rows from a CSV file with a header line.
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<TaskData> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| RehearsalError::Data(format!("{}: {}", path.display(), e)))?;

    let mut values: Vec<f64> = Vec::new();
    let mut labels = Vec::new();
    let mut dim: Option<usize> = None;

    for (line, result) in reader.records().enumerate() {
        let record =
            result.map_err(|e| RehearsalError::Data(format!("{}: {}", path.display(), e)))?;
        if record.len() < 2 {
            return Err(RehearsalError::Data(format!(
                "{}: row {} needs at least one feature and a label",
                path.display(),
                line + 1
            )));
        }

        let row_dim = record.len() - 1;
        match dim {
            None => dim = Some(row_dim),
            Some(d) if d != row_dim => {
                return Err(RehearsalError::Data(format!(
                    "{}: row {} has {} features, expected {}",
                    path.display(),
                    line + 1,
                    row_dim,
                    d
                )))
            }
            _ => {}
        }

        for field in record.iter().take(row_dim) {
            let value: f64 = field.trim().parse().map_err(|_| {
                RehearsalError::Data(format!(
                    "{}: row {}: invalid feature {:?}",
                    path.display(),
                    line + 1,
                    field
                ))
            })?;
            values.push(value);
        }

        let label_field = &record[row_dim];
        let label: f64 = label_field.trim().parse().map_err(|_| {
            RehearsalError::Data(format!(
                "{}: row {}: invalid label {:?}",
                path.display(),
                line + 1,
                label_field
            ))
        })?;
        if label < 0.0 || label.fract() != 0.0 {
            return Err(RehearsalError::Data(format!(
                "{}: row {}: label {} is not a class id",
                path.display(),
                line + 1,
                label
            )));
        }
        labels.push(label as ClassId);
    }

    let dim = dim.unwrap_or(0);
    let features = Array2::from_shape_vec((labels.len(), dim), values)
        .map_err(|e| RehearsalError::Data(format!("{}: {}", path.display(), e)))?;
    TaskData::new(features, labels)
}

/// Parameters for [`synthetic_blobs`].
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Number of classes.
    pub num_classes: usize,
    /// Rows drawn per class.
    pub rows_per_class: usize,
    /// Feature dimension.
    pub dim: usize,
    /// Half-width of the box class centres are drawn from.
    pub center_box: f64,
    /// Standard deviation around each centre.
    pub spread: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            num_classes: 6,
            rows_per_class: 60,
            dim: 8,
            center_box: 5.0,
            spread: 1.0,
            seed: 42,
        }
    }
}

/// Isotropic Gaussian blobs, one per class, rows grouped by class.
///
/// Returns `(train, val)` drawn from the same class centres; validation gets a
/// quarter of the training row count (at least one row per class).
pub fn synthetic_blobs(config: &BlobConfig) -> (TaskData, TaskData) {
    let mut rng = StdRng::seed_from_u64(config.seed);

    let centers: Vec<Vec<f64>> = (0..config.num_classes)
        .map(|_| {
            (0..config.dim)
                .map(|_| rng.gen_range(-config.center_box..=config.center_box))
                .collect()
        })
        .collect();

    let draw = |rows: usize, rng: &mut StdRng| {
        let mut features = Array2::zeros((rows * config.num_classes, config.dim));
        let mut labels = Vec::with_capacity(rows * config.num_classes);
        for (class_id, center) in centers.iter().enumerate() {
            for i in 0..rows {
                let row = class_id * rows + i;
                for (j, c) in center.iter().enumerate() {
                    let z: f64 = rng.sample(StandardNormal);
                    features[[row, j]] = c + config.spread * z;
                }
                labels.push(class_id);
            }
        }
        TaskData { features, labels }
    };

    let train = draw(config.rows_per_class, &mut rng);
    let val = draw((config.rows_per_class / 4).max(1), &mut rng);
    (train, val)
}
