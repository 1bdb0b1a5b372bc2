//! Model contract consumed by the task loop and inference.

use burn::prelude::*;

/// Output of a token classifier forward pass.
#[derive(Debug, Clone)]
pub struct TokenClassifierOutput<B: Backend> {
    /// Per-token scores, shape `(batch, seq_len, num_labels)`.
    pub logits: Tensor<B, 3>,
}

/// Anything that maps padded token ids to per-token logits.
///
/// The task loop only needs this forward pass; everything else about the
/// model (architecture, pretrained weights) stays behind the trait. Training
/// additionally requires the implementor to be a burn `AutodiffModule`.
pub trait TokenClassifier<B: Backend> {
    /// - `input_ids`: `(batch, seq_len)` token ids
    /// - `attention_mask`: `(batch, seq_len)`, `1.0` for real tokens and `0.0`
    ///   for padding
    fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2>,
    ) -> TokenClassifierOutput<B>;

    /// Longest sequence `forward` accepts, if bounded (e.g. by a learned
    /// position table).
    fn max_positions(&self) -> Option<usize> {
        None
    }
}

/// Fail when a batch of `seq_len` tokens is longer than `model` can index.
pub fn ensure_fits<B: Backend, M: TokenClassifier<B> + ?Sized>(model: &M, seq_len: usize) -> anyhow::Result<()> {
    if let Some(max) = model.max_positions() {
        anyhow::ensure!(
            seq_len <= max,
            "batch sequence length {seq_len} exceeds the model's {max} positions"
        );
    }
    Ok(())
}
