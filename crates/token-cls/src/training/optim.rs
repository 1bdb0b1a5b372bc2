//! Optimizer selection.
//!
//! burn optimizers are distinct types, so callers match on [`OptimMethod`]
//! and hand the concrete optimizer to a generic training routine. Gradient
//! clipping is not configured here: the task loop clips the joint norm of all
//! gradients (see `training::clip`), which burn's per-tensor clipping cannot.

use std::fmt;
use std::str::FromStr;

use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, AdamWConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimError {
    #[error("optimizer {0} not yet implemented")]
    NotImplemented(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimMethod {
    /// Adam with L2 weight decay folded into the gradient.
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
}

impl fmt::Display for OptimMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adam => write!(f, "adam"),
            Self::AdamW => write!(f, "adamw"),
        }
    }
}

impl FromStr for OptimMethod {
    type Err = OptimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            _ => Err(OptimError::NotImplemented(s.to_string())),
        }
    }
}

/// Optimizer hyper-parameters shared by every method.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptimizerSettings {
    pub method: OptimMethod,
    pub weight_decay: f64,
}

impl OptimizerSettings {
    pub fn adam_config(&self) -> AdamConfig {
        let decay = (self.weight_decay > 0.0).then(|| WeightDecayConfig::new(self.weight_decay as f32));
        AdamConfig::new().with_weight_decay(decay)
    }

    pub fn adamw_config(&self) -> AdamWConfig {
        AdamWConfig::new().with_weight_decay(self.weight_decay as f32)
    }

    pub fn init_adam<B, M>(&self) -> impl Optimizer<M, B>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        tracing::info!(method = %self.method, weight_decay = self.weight_decay, "Initialized Adam");
        self.adam_config().init()
    }

    pub fn init_adamw<B, M>(&self) -> impl Optimizer<M, B>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        tracing::info!(method = %self.method, weight_decay = self.weight_decay, "Initialized AdamW");
        self.adamw_config().init()
    }
}
