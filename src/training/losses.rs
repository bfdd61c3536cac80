//! Classification loss and accuracy.

use ndarray::{Array2, ArrayView2, Axis};

use crate::{RehearsalError, Result};

/// Row-wise softmax, shifted by the row maximum.
pub fn softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut probs = logits.to_owned();
    for mut row in probs.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    probs
}

fn check_targets(logits: ArrayView2<f64>, targets: &[usize]) -> Result<()> {
    if logits.nrows() != targets.len() {
        return Err(RehearsalError::ShapeMismatch {
            features: logits.nrows(),
            labels: targets.len(),
        });
    }
    if let Some(&bad) = targets.iter().find(|&&t| t >= logits.ncols()) {
        return Err(RehearsalError::Model(format!(
            "target {} outside {} model classes",
            bad,
            logits.ncols()
        )));
    }
    Ok(())
}

/// Mean softmax cross-entropy and its gradient w.r.t. the logits.
pub fn cross_entropy(logits: ArrayView2<f64>, targets: &[usize]) -> Result<(f64, Array2<f64>)> {
    check_targets(logits, targets)?;
    let n = targets.len().max(1) as f64;

    let mut grad = softmax(logits);
    let mut loss = 0.0;
    for (i, &t) in targets.iter().enumerate() {
        let p = grad[[i, t]];
        // Clamp underflow only; NaN must reach the caller
        loss -= if p.is_nan() { p } else { p.max(f64::MIN_POSITIVE).ln() };
        grad[[i, t]] -= 1.0;
    }
    grad /= n;
    Ok((loss / n, grad))
}

/// Index of the largest logit per row.
pub fn argmax_rows(logits: ArrayView2<f64>) -> Vec<usize> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Top-`k` accuracy in percent.
pub fn accuracy(logits: ArrayView2<f64>, targets: &[usize], k: usize) -> Result<f64> {
    check_targets(logits, targets)?;
    if targets.is_empty() {
        return Ok(0.0);
    }

    let hits = logits
        .axis_iter(Axis(0))
        .zip(targets)
        .filter(|(row, t)| {
            // Rank of the target: classes scoring strictly higher
            let target_score = row[**t];
            row.iter().filter(|&&v| v > target_score).count() < k
        })
        .count();
    Ok(100.0 * hits as f64 / targets.len() as f64)
}

/// `k` for the second accuracy column: 5, or fewer when the model is smaller.
pub fn top_k(num_classes: usize) -> usize {
    num_classes.clamp(1, 5)
}
