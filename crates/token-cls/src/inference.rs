//! Thresholded per-token predictions for unlabelled batches.
//!
//! Batches reuse [`TokenBatch`]; for inference its `labels` array is a token
//! mask where `ignore_index` marks positions without a prediction (special
//! tokens, sub-word continuations, padding).

use std::path::Path;

use burn::prelude::*;
use shards::{TokenBatch, IGNORE_INDEX};

use crate::model::bridge::{bool_values, float_values, to_device};
use crate::model::classifier::{ensure_fits, TokenClassifier};
use crate::model::tagger::{TaggerConfig, TransformerTagger};
use crate::training::checkpoint::load_checkpoint;

/// Predict `0/1` labels for every valid position of every sentence.
///
/// Returns one vector per sentence, in input order across all batches. Each
/// vector has as many entries as the sentence has valid mask positions.
pub fn inference<B, M, I>(
    model: &M,
    batches: I,
    device: &B::Device,
    pad_token_id: i64,
    ignore_index: i64,
    threshold: f64,
) -> anyhow::Result<Vec<Vec<i64>>>
where
    B: Backend,
    M: TokenClassifier<B>,
    I: IntoIterator<Item = TokenBatch>,
{
    let mut preds = Vec::new();

    for host in batches {
        ensure_fits(model, host.seq_len)?;
        let batch = to_device::<B>(&host, device);
        let attention_mask = batch.input_ids.clone().not_equal_elem(pad_token_id).float();

        let probs = burn::tensor::activation::sigmoid(
            model.forward(batch.input_ids, attention_mask).logits.squeeze::<2>(2),
        );
        let mask = batch.labels.not_equal_elem(ignore_index);
        anyhow::ensure!(
            mask.dims() == probs.dims(),
            "token mask shape {:?} does not match prediction shape {:?}",
            mask.dims(),
            probs.dims()
        );

        let [rows, cols] = probs.dims();
        let probs = float_values(probs)?;
        let mask = bool_values(mask)?;
        for r in 0..rows {
            let span = r * cols..(r + 1) * cols;
            let sentence = probs[span.clone()]
                .iter()
                .zip(&mask[span])
                .filter(|(_, keep)| **keep)
                .map(|(&p, _)| i64::from(p as f64 > threshold))
                .collect();
            preds.push(sentence);
        }
    }
    Ok(preds)
}

/// A loaded tagger bundled with the settings needed to run it.
pub struct TokenTagger<B: Backend> {
    model: TransformerTagger<B>,
    device: B::Device,
    pad_token_id: i64,
    threshold: f64,
}

impl<B: Backend> TokenTagger<B> {
    pub fn new(model: TransformerTagger<B>, config: &TaggerConfig, device: B::Device) -> Self {
        Self {
            model,
            device,
            pad_token_id: config.pad_token_id as i64,
            threshold: 0.5,
        }
    }

    /// Rebuild the tagger from `config` and load weights from a checkpoint.
    pub fn load(path: &Path, config: &TaggerConfig, device: B::Device) -> anyhow::Result<Self> {
        let model = load_checkpoint::<B>(path, config, &device)?;
        Ok(Self::new(model, config, device))
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn predict<I>(&self, batches: I) -> anyhow::Result<Vec<Vec<i64>>>
    where
        I: IntoIterator<Item = TokenBatch>,
    {
        inference(
            &self.model,
            batches,
            &self.device,
            self.pad_token_id,
            IGNORE_INDEX,
            self.threshold,
        )
    }
}
