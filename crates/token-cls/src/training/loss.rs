//! Masked binary cross-entropy for token classification.
//!
//! Loss construction goes through the closed [`LossKind`] enumeration; the
//! string form exists for CLI/config plumbing and is rejected up front when
//! it names an unsupported loss.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;

/// Loss construction failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LossError {
    /// The requested loss kind has no implementation.
    #[error("loss {0} not yet implemented")]
    NotImplemented(String),
}

/// Supported loss kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    BinaryCrossEntropy,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryCrossEntropy => write!(f, "binary_cross_entropy"),
        }
    }
}

impl FromStr for LossKind {
    type Err = LossError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary_cross_entropy" => Ok(Self::BinaryCrossEntropy),
            other => Err(LossError::NotImplemented(other.to_string())),
        }
    }
}

/// How elementwise losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Keep one value per element.
    #[default]
    None,
    Mean,
    Sum,
}

/// Caller-facing description of the loss to build for an epoch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LossSpec {
    /// Loss identifier, e.g. `"binary_cross_entropy"`.
    pub kind: String,
    /// Weight applied to the positive class.
    pub pos_weight: Option<f64>,
}

impl Default for LossSpec {
    fn default() -> Self {
        Self {
            kind: LossKind::BinaryCrossEntropy.to_string(),
            pos_weight: None,
        }
    }
}

impl LossSpec {
    pub fn with_pos_weight(mut self, pos_weight: f64) -> Self {
        self.pos_weight = Some(pos_weight);
        self
    }

    /// Build the elementwise (unreduced) loss for this kind and weight.
    pub fn build(&self) -> Result<TokenLoss, LossError> {
        get_loss_fn(&self.kind, Reduction::None, self.pos_weight)
    }
}

/// Binary cross-entropy on raw logits with an optional positive-class weight.
///
/// Uses the stable form `(1 - y)·x + (1 + (w - 1)·y)·softplus(-x)`, where
/// `softplus(-x) = log1p(exp(-|x|)) + max(-x, 0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BceWithLogits {
    pub pos_weight: Option<f64>,
}

impl BceWithLogits {
    pub fn elementwise<B: Backend, const D: usize>(
        &self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let softplus_neg = logits.clone().abs().neg().exp().log1p() + logits.clone().neg().clamp_min(0.0);
        let negatives = targets.clone().neg().add_scalar(1.0) * logits;

        match self.pos_weight {
            Some(w) => {
                let log_weight = targets.mul_scalar(w - 1.0).add_scalar(1.0);
                negatives + log_weight * softplus_neg
            }
            None => negatives + softplus_neg,
        }
    }
}

/// A configured loss functor mapping `(logits, targets)` to losses.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLoss {
    kind: TokenLossKind,
    reduction: Reduction,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenLossKind {
    BinaryCrossEntropy(BceWithLogits),
}

impl TokenLoss {
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Per-element loss, same shape as the inputs. Ignores the reduction.
    pub fn elementwise<B: Backend, const D: usize>(
        &self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match &self.kind {
            TokenLossKind::BinaryCrossEntropy(bce) => bce.elementwise(logits, targets),
        }
    }

    /// Loss with the configured reduction applied. `Reduction::None` returns
    /// the flattened elementwise values.
    pub fn forward<B: Backend, const D: usize>(
        &self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let loss = self.elementwise(logits, targets);
        match self.reduction {
            Reduction::None => loss.flatten::<1>(0, D - 1),
            Reduction::Mean => loss.mean(),
            Reduction::Sum => loss.sum(),
        }
    }
}

/// Build a loss functor from its string identifier.
///
/// Only `"binary_cross_entropy"` is supported; anything else fails with
/// [`LossError::NotImplemented`].
pub fn get_loss_fn(
    kind: &str,
    reduction: Reduction,
    pos_weight: Option<f64>,
) -> Result<TokenLoss, LossError> {
    let kind = match kind.parse::<LossKind>()? {
        LossKind::BinaryCrossEntropy => {
            TokenLossKind::BinaryCrossEntropy(BceWithLogits { pos_weight })
        }
    };
    Ok(TokenLoss { kind, reduction })
}

/// Masked per-sequence loss for a batch.
///
/// Elementwise loss is zeroed where `label_mask` is false, then averaged over
/// the sequence axis and over the batch. The sequence mean divides by the
/// padded length, not by the number of valid labels.
///
/// - `logits`: `(batch, seq_len)`
/// - `labels`: `(batch, seq_len)` integer labels; masked positions may hold
///   any sentinel
/// - `label_mask`: `(batch, seq_len)`, true where the label is scored
///
/// Returns a `(1,)` tensor.
pub fn masked_sequence_loss<B: Backend>(
    loss_fn: &TokenLoss,
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2, Int>,
    label_mask: Tensor<B, 2, Bool>,
) -> Tensor<B, 1> {
    let mask = label_mask.clone().float();
    let targets = labels.float().mask_fill(label_mask.bool_not(), 0.0);
    let loss = loss_fn.elementwise(logits, targets) * mask;
    loss.mean_dim(1).mean()
}
