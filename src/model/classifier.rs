//! Expandable classifier with one output head per task.
//!
//! Input features are cut into fixed-size patches that share a linear
//! embedding with ReLU. Patch embeddings are mean-pooled and fed to every task
//! head; the logits of all heads are concatenated in task order.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::{load_json, save_json};
use crate::{RehearsalError, Result};

/// Capability contract the continual trainer relies on.
pub trait ExpandableModel {
    /// Total output classes across all heads.
    fn num_classes(&self) -> usize;

    /// Add a head with `increment` new classes.
    fn expand_model(&mut self, increment: usize) -> Result<()>;

    /// Freeze everything learned before the newest head.
    fn freeze_old_params(&mut self);

    /// Logits of shape `(batch, num_classes)`.
    fn forward(&self, batch: ArrayView2<f64>) -> Result<Array2<f64>>;

    /// Gradients of the loss w.r.t. the trainable parameters, in the order of
    /// [`ExpandableModel::trainable_params_mut`].
    fn backward(&self, batch: ArrayView2<f64>, grad_logits: ArrayView2<f64>)
        -> Result<Vec<Array2<f64>>>;

    fn trainable_params_mut(&mut self) -> Vec<&mut Array2<f64>>;

    /// Number of trainable scalars.
    fn num_trainable(&self) -> usize;

    /// Serialize the whole model to `path`.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Classes of the first task.
    pub initial_classes: usize,
    pub feature_dim: usize,
    /// Batch size the model is built for. Kept with the model on disk and
    /// checked at construction only: `forward` takes any number of rows, and
    /// training batches are sized by `TrainerConfig::batch_size`.
    pub batch_size: usize,
    pub patch_size: usize,
    pub embed_dim: usize,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            initial_classes: 2,
            feature_dim: 8,
            batch_size: 32,
            patch_size: 4,
            embed_dim: 32,
            seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("initial_classes", self.initial_classes),
            ("feature_dim", self.feature_dim),
            ("batch_size", self.batch_size),
            ("patch_size", self.patch_size),
            ("embed_dim", self.embed_dim),
        ] {
            if value == 0 {
                return Err(RehearsalError::InvalidConfig(format!(
                    "model {} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Patches per row, the last one zero-padded.
    pub fn num_patches(&self) -> usize {
        (self.feature_dim + self.patch_size - 1) / self.patch_size
    }
}

/// Weight matrix plus a `1 x out` bias row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Linear {
    weights: Array2<f64>,
    bias: Array2<f64>,
    frozen: bool,
}

impl Linear {
    /// Xavier-uniform weights, zero bias.
    fn new(input: usize, output: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input + output) as f64).sqrt();
        Self {
            weights: Array2::random_using((input, output), Uniform::new(-limit, limit), rng),
            bias: Array2::zeros((1, output)),
            frozen: false,
        }
    }

    fn apply(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weights) + &self.bias
    }

    fn outputs(&self) -> usize {
        self.weights.ncols()
    }
}

/// Patch-embedding classifier that grows a head per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalClassifier {
    config: ModelConfig,
    embedding: Linear,
    heads: Vec<Linear>,
}

impl IncrementalClassifier {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let embedding = Linear::new(config.patch_size, config.embed_dim, &mut rng);
        let head = Linear::new(config.embed_dim, config.initial_classes, &mut rng);
        Ok(Self {
            config,
            embedding,
            heads: vec![head],
        })
    }

    /// Read a model written by [`ExpandableModel::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    /// Classes per head, in task order.
    pub fn head_sizes(&self) -> Vec<usize> {
        self.heads.iter().map(Linear::outputs).collect()
    }

    /// Zero-padded `(batch, patch_size)` slices of the input.
    fn patches(&self, batch: ArrayView2<f64>) -> Vec<Array2<f64>> {
        let (rows, dim) = batch.dim();
        let size = self.config.patch_size;
        (0..self.config.num_patches())
            .map(|p| {
                let start = p * size;
                let end = (start + size).min(dim);
                let mut patch = Array2::zeros((rows, size));
                patch
                    .slice_mut(s![.., ..end - start])
                    .assign(&batch.slice(s![.., start..end]));
                patch
            })
            .collect()
    }

    /// Pre-activations per patch and the pooled embedding.
    fn embed(&self, batch: ArrayView2<f64>) -> (Vec<Array2<f64>>, Array2<f64>) {
        let patches = self.patches(batch);
        let mut pooled = Array2::zeros((batch.nrows(), self.config.embed_dim));
        let mut pre = Vec::with_capacity(patches.len());
        for patch in &patches {
            let z = self.embedding.apply(patch);
            // NaN passes through so a bad input row surfaces in the loss
            pooled += &z.mapv(|v| if v < 0.0 { 0.0 } else { v });
            pre.push(z);
        }
        pooled /= patches.len() as f64;
        (pre, pooled)
    }

    fn check_input(&self, batch: ArrayView2<f64>) -> Result<()> {
        if batch.ncols() != self.config.feature_dim {
            return Err(RehearsalError::Model(format!(
                "expected {} features, got {}",
                self.config.feature_dim,
                batch.ncols()
            )));
        }
        Ok(())
    }
}

impl ExpandableModel for IncrementalClassifier {
    fn num_classes(&self) -> usize {
        self.heads.iter().map(Linear::outputs).sum()
    }

    fn expand_model(&mut self, increment: usize) -> Result<()> {
        if increment == 0 {
            return Err(RehearsalError::Model(
                "cannot expand by zero classes".to_string(),
            ));
        }
        // Seed offset by head index
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.heads.len() as u64));
        self.heads
            .push(Linear::new(self.config.embed_dim, increment, &mut rng));
        tracing::debug!(
            "Expanded model to {} heads, {} classes",
            self.heads.len(),
            self.num_classes()
        );
        Ok(())
    }

    fn freeze_old_params(&mut self) {
        self.embedding.frozen = true;
        let newest = self.heads.len() - 1;
        for (i, head) in self.heads.iter_mut().enumerate() {
            head.frozen = i != newest;
        }
    }

    fn forward(&self, batch: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_input(batch)?;
        let (_, pooled) = self.embed(batch);
        let logits: Vec<Array2<f64>> = self.heads.iter().map(|h| h.apply(&pooled)).collect();
        let views: Vec<ArrayView2<f64>> = logits.iter().map(|l| l.view()).collect();
        concatenate(Axis(1), &views).map_err(|e| RehearsalError::Model(e.to_string()))
    }

    fn backward(
        &self,
        batch: ArrayView2<f64>,
        grad_logits: ArrayView2<f64>,
    ) -> Result<Vec<Array2<f64>>> {
        self.check_input(batch)?;
        if grad_logits.dim() != (batch.nrows(), self.num_classes()) {
            return Err(RehearsalError::Model(format!(
                "gradient shape {:?} does not match logits ({}, {})",
                grad_logits.dim(),
                batch.nrows(),
                self.num_classes()
            )));
        }

        let (pre, pooled) = self.embed(batch);
        let mut grad_pooled = Array2::<f64>::zeros(pooled.dim());
        let mut head_grads = Vec::new();

        let mut offset = 0;
        for head in &self.heads {
            let width = head.outputs();
            let g = grad_logits.slice(s![.., offset..offset + width]);
            offset += width;

            if !self.embedding.frozen {
                grad_pooled += &g.dot(&head.weights.t());
            }
            if !head.frozen {
                head_grads.push(pooled.t().dot(&g));
                head_grads.push(g.sum_axis(Axis(0)).insert_axis(Axis(0)));
            }
        }

        let mut grads = Vec::with_capacity(head_grads.len() + 2);
        if !self.embedding.frozen {
            let patches = self.patches(batch);
            let scale = 1.0 / patches.len() as f64;
            let mut grad_w = Array2::zeros(self.embedding.weights.dim());
            let mut grad_b = Array2::zeros(self.embedding.bias.dim());
            for (patch, z) in patches.iter().zip(&pre) {
                let mask = z.mapv(|v| if v > 0.0 { scale } else { 0.0 });
                let delta = &grad_pooled * &mask;
                grad_w += &patch.t().dot(&delta);
                grad_b += &delta.sum_axis(Axis(0)).insert_axis(Axis(0));
            }
            grads.push(grad_w);
            grads.push(grad_b);
        }
        grads.extend(head_grads);
        Ok(grads)
    }

    fn trainable_params_mut(&mut self) -> Vec<&mut Array2<f64>> {
        let mut params = Vec::new();
        if !self.embedding.frozen {
            params.push(&mut self.embedding.weights);
            params.push(&mut self.embedding.bias);
        }
        for head in self.heads.iter_mut().filter(|h| !h.frozen) {
            params.push(&mut head.weights);
            params.push(&mut head.bias);
        }
        params
    }

    fn num_trainable(&self) -> usize {
        let embedding = if self.embedding.frozen {
            0
        } else {
            self.embedding.weights.len() + self.embedding.bias.len()
        };
        embedding
            + self
                .heads
                .iter()
                .filter(|h| !h.frozen)
                .map(|h| h.weights.len() + h.bias.len())
                .sum::<usize>()
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)?;
        tracing::info!("Saved model to {}", path.display());
        Ok(())
    }
}
