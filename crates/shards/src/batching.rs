//! Token-budget batching over in-memory records.
//!
//! Sentences are sorted by length and grouped greedily so that every batch
//! stays within `max_tokens_per_batch` (counting padding) and
//! `max_sentences_per_batch`. Batch composition is fixed once; each epoch
//! only reshuffles the batch order, seeded by `(seed, epoch)` so runs are
//! reproducible.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::types::{TokenRecord, IGNORE_INDEX};

/// Sizing limits for building batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Token id written into padding positions of `input_ids`.
    pub pad_token_id: i64,
    /// Label written into padding positions of `labels`.
    pub ignore_index: i64,
    /// Upper bound on `batch_size * longest_sentence` for one batch.
    pub max_tokens_per_batch: usize,
    /// Upper bound on the number of sentences in one batch.
    pub max_sentences_per_batch: usize,
    /// Sentences longer than this are truncated at load time.
    pub max_sentence_length: usize,
    /// Optional cap on the number of batches yielded per epoch.
    pub max_batches_per_epoch: Option<usize>,
    /// Base seed for the per-epoch shuffle.
    pub seed: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            pad_token_id: 1,
            ignore_index: IGNORE_INDEX,
            max_tokens_per_batch: 10_000,
            max_sentences_per_batch: 600,
            max_sentence_length: 256,
            max_batches_per_epoch: None,
            seed: 0,
        }
    }
}

impl BatchingConfig {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_tokens_per_batch > 0, "max_tokens_per_batch must be > 0");
        anyhow::ensure!(self.max_sentences_per_batch > 0, "max_sentences_per_batch must be > 0");
        anyhow::ensure!(self.max_sentence_length > 0, "max_sentence_length must be > 0");
        Ok(())
    }
}

/// A padded batch held on the host, row-major `(batch_size, seq_len)`.
///
/// For inference batches the second array carries a token-validity mask
/// (same sentinel convention as labels) rather than gold labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub input_ids: Vec<i64>,
    pub labels: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl TokenBatch {
    /// Right-pad `records` to the longest one.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a TokenRecord>,
        pad_token_id: i64,
        ignore_index: i64,
    ) -> Self {
        let records: Vec<&TokenRecord> = records.into_iter().collect();
        let seq_len = records.iter().map(|r| r.len()).max().unwrap_or(0);
        let batch_size = records.len();

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut labels = Vec::with_capacity(batch_size * seq_len);
        for r in &records {
            let pad = seq_len - r.len();
            input_ids.extend_from_slice(&r.input_ids);
            input_ids.extend(std::iter::repeat(pad_token_id).take(pad));
            labels.extend_from_slice(&r.labels);
            labels.extend(std::iter::repeat(ignore_index).take(pad));
        }

        Self {
            input_ids,
            labels,
            batch_size,
            seq_len,
        }
    }

    /// Token ids and labels of row `i`, including padding.
    pub fn row(&self, i: usize) -> (&[i64], &[i64]) {
        let start = i * self.seq_len;
        let end = start + self.seq_len;
        (&self.input_ids[start..end], &self.labels[start..end])
    }

    /// Number of cells, padding included.
    pub fn num_tokens(&self) -> usize {
        self.batch_size * self.seq_len
    }

    /// Count of positions whose label is not `ignore_index`.
    pub fn num_labelled(&self, ignore_index: i64) -> usize {
        self.labels.iter().filter(|&&l| l != ignore_index).count()
    }
}

/// Greedily group length-sorted sentence indices under the token and
/// sentence budgets.
fn build_batches(records: &[TokenRecord], config: &BatchingConfig) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| records[i].len());

    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_max = 0usize;

    for i in order {
        let len = records[i].len();
        let new_max = current_max.max(len);
        let over_sentences = current.len() + 1 > config.max_sentences_per_batch;
        let over_tokens = new_max * (current.len() + 1) > config.max_tokens_per_batch;
        if !current.is_empty() && (over_sentences || over_tokens) {
            batches.push(std::mem::take(&mut current));
            current_max = 0;
        }
        if len > config.max_tokens_per_batch {
            tracing::warn!(
                len,
                max_tokens = config.max_tokens_per_batch,
                "Sentence exceeds the token budget on its own; emitting a single-sentence batch"
            );
        }
        current_max = current_max.max(len);
        current.push(i);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Produces one iterator of padded batches per epoch.
pub struct EpochBatchIterator {
    records: Vec<TokenRecord>,
    batches: Vec<Vec<usize>>,
    config: BatchingConfig,
    epoch: usize,
}

impl EpochBatchIterator {
    /// Truncate, drop empty sentences, and precompute batch composition.
    pub fn new(records: Vec<TokenRecord>, config: BatchingConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let total = records.len();
        let records: Vec<TokenRecord> = records
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(|mut r| {
                r.truncate(config.max_sentence_length);
                r
            })
            .collect();
        if records.len() < total {
            tracing::debug!(dropped = total - records.len(), "Dropped empty sentences");
        }

        let batches = build_batches(&records, &config);
        tracing::info!(
            sentences = records.len(),
            batches = batches.len(),
            max_tokens = config.max_tokens_per_batch,
            max_sentences = config.max_sentences_per_batch,
            "Built token-budget batches"
        );

        Ok(Self {
            records,
            batches,
            config,
            epoch: 0,
        })
    }

    /// Number of batches one epoch yields (after the optional cap).
    pub fn len(&self) -> usize {
        match self.config.max_batches_per_epoch {
            Some(cap) => self.batches.len().min(cap),
            None => self.batches.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of epochs handed out so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Start the next epoch. With `shuffle`, the batch order is permuted with
    /// an RNG seeded from the base seed and the epoch number.
    pub fn next_epoch_itr(&mut self, shuffle: bool) -> EpochIter<'_> {
        self.epoch += 1;
        let mut order: Vec<usize> = (0..self.batches.len()).collect();
        if shuffle {
            let mut rng =
                rand::rngs::StdRng::seed_from_u64(self.config.seed.wrapping_add(self.epoch as u64));
            order.shuffle(&mut rng);
        }
        order.truncate(self.len());
        EpochIter {
            source: self,
            order: order.into_iter(),
        }
    }
}

/// Iterator over the padded batches of one epoch.
pub struct EpochIter<'a> {
    source: &'a EpochBatchIterator,
    order: std::vec::IntoIter<usize>,
}

impl Iterator for EpochIter<'_> {
    type Item = TokenBatch;

    fn next(&mut self) -> Option<TokenBatch> {
        let b = self.order.next()?;
        let source = self.source;
        let cfg = &source.config;
        let rows = source.batches[b].iter().map(|&i| &source.records[i]);
        Some(TokenBatch::from_records(rows, cfg.pad_token_id, cfg.ignore_index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

impl ExactSizeIterator for EpochIter<'_> {}
