//! Optimization Algorithms
//!
//! Gradient-based optimizers over a list of parameter matrices:
//! - SGD with momentum and L2 weight decay
//! - Adam with L2 weight decay
//! - AdamW with decoupled weight decay
//!
//! Per-parameter state is positional. After the parameter list changes (the
//! model grew or was frozen) call [`Optimizer::reset`].

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{RehearsalError, Result};

/// Optimizer trait for parameter updates
pub trait Optimizer: Send {
    /// Apply one update; `grads[i]` belongs to `params[i]`.
    fn step(&mut self, params: &mut [&mut Array2<f64>], grads: &[Array2<f64>]) -> Result<()>;

    /// Drop all accumulated state.
    fn reset(&mut self);

    fn learning_rate(&self) -> f64;
}

fn check_shapes(params: &[&mut Array2<f64>], grads: &[Array2<f64>]) -> Result<()> {
    if params.len() != grads.len() {
        return Err(RehearsalError::Model(format!(
            "{} parameters but {} gradients",
            params.len(),
            grads.len()
        )));
    }
    for (i, (p, g)) in params.iter().zip(grads).enumerate() {
        if p.dim() != g.dim() {
            return Err(RehearsalError::Model(format!(
                "parameter {} has shape {:?}, gradient {:?}",
                i,
                p.dim(),
                g.dim()
            )));
        }
    }
    Ok(())
}

/// Zeroed state matching `params`, unless the existing state already does.
fn ensure_state(state: &mut Vec<Array2<f64>>, params: &[&mut Array2<f64>]) {
    let matches = state.len() == params.len()
        && state.iter().zip(params).all(|(s, p)| s.dim() == p.dim());
    if !matches {
        *state = params.iter().map(|p| Array2::zeros(p.dim())).collect();
    }
}

/// Stochastic Gradient Descent with optional momentum
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    velocity: Vec<Array2<f64>>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Array2<f64>], grads: &[Array2<f64>]) -> Result<()> {
        check_shapes(params, grads)?;
        ensure_state(&mut self.velocity, params);

        for ((p, g), v) in params.iter_mut().zip(grads).zip(self.velocity.iter_mut()) {
            let grad = g + &(&**p * self.weight_decay);
            if self.momentum > 0.0 {
                *v = &*v * self.momentum + &grad;
                **p -= &(&*v * self.learning_rate);
            } else {
                **p -= &(grad * self.learning_rate);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

/// Adam optimizer (Adaptive Moment Estimation)
///
/// With `decoupled` set, weight decay is applied directly to the parameters
/// (AdamW) instead of being added to the gradient.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub decoupled: bool,
    t: i32,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            decoupled: false,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// AdamW: Adam with decoupled weight decay.
    pub fn adamw(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            weight_decay,
            decoupled: true,
            ..Self::new(learning_rate)
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Array2<f64>], grads: &[Array2<f64>]) -> Result<()> {
        check_shapes(params, grads)?;
        let fresh = self.m.len() != params.len();
        ensure_state(&mut self.m, params);
        ensure_state(&mut self.v, params);
        if fresh {
            self.t = 0;
        }
        self.t += 1;

        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);

        for (i, (p, g)) in params.iter_mut().zip(grads).enumerate() {
            let grad = if self.decoupled || self.weight_decay == 0.0 {
                g.clone()
            } else {
                g + &(&**p * self.weight_decay)
            };

            let m = &mut self.m[i];
            let v = &mut self.v[i];
            *m = &*m * self.beta1 + &grad * (1.0 - self.beta1);
            *v = &*v * self.beta2 + &(&grad * &grad) * (1.0 - self.beta2);

            let m_hat = &*m / bias1;
            let v_hat = &*v / bias2;

            if self.decoupled && self.weight_decay > 0.0 {
                let decay = 1.0 - self.learning_rate * self.weight_decay;
                p.mapv_inplace(|w| w * decay);
            }
            **p -= &(&m_hat * self.learning_rate / &(v_hat.mapv(f64::sqrt) + self.epsilon));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

/// Named optimizer choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum OptimizerKind {
    #[serde(rename = "SGD", alias = "sgd")]
    #[value(name = "sgd")]
    Sgd,
    #[default]
    #[serde(alias = "adam")]
    Adam,
    #[serde(rename = "AdamW", alias = "adamw")]
    #[value(name = "adamw")]
    AdamW,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "SGD"),
            OptimizerKind::Adam => write!(f, "Adam"),
            OptimizerKind::AdamW => write!(f, "AdamW"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = RehearsalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            other => Err(RehearsalError::InvalidConfig(format!(
                "unknown optimizer: {}",
                other
            ))),
        }
    }
}

/// Optimizer name plus hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    /// Used by SGD only.
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 1e-3,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(RehearsalError::InvalidConfig(
                "learning_rate must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(RehearsalError::InvalidConfig(
                "momentum must be in [0, 1)".to_string(),
            ));
        }
        if self.weight_decay < 0.0 {
            return Err(RehearsalError::InvalidConfig(
                "weight_decay must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn Optimizer> {
        match self.kind {
            OptimizerKind::Sgd => Box::new(
                Sgd::new(self.learning_rate)
                    .with_momentum(self.momentum)
                    .with_weight_decay(self.weight_decay),
            ),
            OptimizerKind::Adam => {
                Box::new(Adam::new(self.learning_rate).with_weight_decay(self.weight_decay))
            }
            OptimizerKind::AdamW => Box::new(Adam::adamw(self.learning_rate, self.weight_decay)),
        }
    }
}
