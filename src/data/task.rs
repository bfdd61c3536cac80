//! Labelled task data.

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{ClassId, RehearsalError, Result};

/// Labelled feature matrix: `features` is N×D, `labels` holds N class ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    /// Feature rows.
    pub features: Array2<f64>,
    /// One label per feature row.
    pub labels: Vec<ClassId>,
}

impl TaskData {
    /// Create task data, checking that rows and labels line up.
    pub fn new(features: Array2<f64>, labels: Vec<ClassId>) -> Result<Self> {
        let data = Self { features, labels };
        data.validate()?;
        Ok(data)
    }

    /// Empty data set with the given feature dimension.
    pub fn empty(dim: usize) -> Self {
        Self {
            features: Array2::zeros((0, dim)),
            labels: Vec::new(),
        }
    }

    /// Fails with [`RehearsalError::ShapeMismatch`] if row and label counts differ.
    pub fn validate(&self) -> Result<()> {
        if self.features.nrows() != self.labels.len() {
            return Err(RehearsalError::ShapeMismatch {
                features: self.features.nrows(),
                labels: self.labels.len(),
            });
        }
        Ok(())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Feature dimension.
    pub fn dim(&self) -> usize {
        self.features.ncols()
    }

    /// Distinct labels in ascending order.
    pub fn classes(&self) -> Vec<ClassId> {
        let mut classes = self.labels.clone();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Rows belonging to `class_id`.
    pub fn class_rows(&self, class_id: ClassId) -> Array2<f64> {
        let indices: Vec<usize> = self
            .labels
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label == class_id)
            .map(|(i, _)| i)
            .collect();
        self.features.select(Axis(0), &indices)
    }

    /// Rows at the given indices, in that order.
    pub fn subset(&self, indices: &[usize]) -> TaskData {
        TaskData {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Append `other` below `self`. Empty operands are accepted regardless of
    /// their recorded dimension.
    pub fn concat(&self, other: &TaskData) -> Result<TaskData> {
        self.validate()?;
        other.validate()?;

        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        if self.dim() != other.dim() {
            return Err(RehearsalError::Data(format!(
                "cannot concatenate {}-dimensional rows with {}-dimensional rows",
                self.dim(),
                other.dim()
            )));
        }

        let views: [ArrayView2<f64>; 2] = [self.features.view(), other.features.view()];
        let features = concatenate(Axis(0), &views)
            .map_err(|e| RehearsalError::Data(format!("concatenate failed: {}", e)))?;
        let mut labels = self.labels.clone();
        labels.extend_from_slice(&other.labels);

        Ok(TaskData { features, labels })
    }
}

/// Train/validation pair for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSplit {
    /// Training rows.
    pub train: TaskData,
    /// Validation rows.
    pub val: TaskData,
}

/// Ordered sequence of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSequence {
    /// Task splits in arrival order.
    pub tasks: Vec<TaskSplit>,
    /// Original class ids in the order they were assigned to tasks.
    pub class_order: Vec<ClassId>,
    /// Number of classes introduced by each task.
    pub classes_per_task: Vec<usize>,
}

impl TaskSequence {
    /// Number of tasks.
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Feature dimension of the first task, or 0 if there are no tasks.
    pub fn feature_dim(&self) -> usize {
        self.tasks.first().map(|t| t.train.dim()).unwrap_or(0)
    }

    /// Total number of classes across all tasks.
    pub fn total_classes(&self) -> usize {
        self.classes_per_task.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn two_class_data() -> TaskData {
        TaskData::new(
            arr2(&[[0.0, 1.0], [1.0, 1.0], [5.0, 5.0], [6.0, 5.0]]),
            vec![1, 0, 1, 0],
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch() {
        let result = TaskData::new(Array2::zeros((3, 2)), vec![0, 1]);
        assert!(matches!(
            result,
            Err(RehearsalError::ShapeMismatch { features: 3, labels: 2 })
        ));
    }

    #[test]
    fn test_classes_sorted_unique() {
        assert_eq!(two_class_data().classes(), vec![0, 1]);
    }

    #[test]
    fn test_class_rows() {
        let rows = two_class_data().class_rows(1);
        assert_eq!(rows, arr2(&[[0.0, 1.0], [5.0, 5.0]]));
    }

    #[test]
    fn test_concat() {
        let a = two_class_data();
        let b = TaskData::new(arr2(&[[9.0, 9.0]]), vec![2]).unwrap();
        let merged = a.concat(&b).unwrap();
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.labels, vec![1, 0, 1, 0, 2]);
        assert_eq!(merged.features.row(4).to_vec(), vec![9.0, 9.0]);
    }

    #[test]
    fn test_concat_with_empty() {
        let a = two_class_data();
        let empty = TaskData::empty(0);
        assert_eq!(a.concat(&empty).unwrap(), a);
        assert_eq!(empty.concat(&a).unwrap(), a);
    }

    #[test]
    fn test_concat_dim_mismatch() {
        let a = two_class_data();
        let b = TaskData::new(arr2(&[[1.0, 2.0, 3.0]]), vec![0]).unwrap();
        assert!(a.concat(&b).is_err());
    }

    #[test]
    fn test_subset() {
        let sub = two_class_data().subset(&[3, 0]);
        assert_eq!(sub.labels, vec![0, 1]);
        assert_eq!(sub.features.row(0).to_vec(), vec![6.0, 5.0]);
    }
}
