//! Data types for token classification records and shard files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Label value marking positions that are not scored (padding, sub-word
/// continuations, special tokens).
pub const IGNORE_INDEX: i64 = -100;

/// On-disk encoding of a shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardFormat {
    /// Apache Parquet (`.parquet`).
    Parquet,
    /// Arrow IPC, stream or file flavour (`.arrow`).
    Arrow,
}

impl fmt::Display for ShardFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parquet => write!(f, "parquet"),
            Self::Arrow => write!(f, "arrow"),
        }
    }
}

impl ShardFormat {
    /// Infer the format from a file extension. Returns `None` for anything
    /// that is not a known shard extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("parquet") => Some(Self::Parquet),
            Some("arrow") => Some(Self::Arrow),
            _ => None,
        }
    }
}

/// One tokenized sentence with per-token binary labels.
///
/// `input_ids` and `labels` always have the same length. Labels are `0`/`1`
/// for scored tokens and [`IGNORE_INDEX`] elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token ids produced by the encoder's tokenizer.
    pub input_ids: Vec<i64>,
    /// Per-token labels, aligned with `input_ids`.
    pub labels: Vec<i64>,
}

impl TokenRecord {
    pub fn new(input_ids: Vec<i64>, labels: Vec<i64>) -> Self {
        Self { input_ids, labels }
    }

    /// Number of tokens in the sentence.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of positions that carry a real label.
    pub fn num_labelled(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }

    /// Cut the sentence down to at most `max_len` tokens.
    pub fn truncate(&mut self, max_len: usize) {
        self.input_ids.truncate(max_len);
        self.labels.truncate(max_len);
    }
}

/// Summary statistics for one or more shard files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSummary {
    /// Number of sentences.
    pub records: usize,
    /// Total number of tokens over all sentences.
    pub tokens: usize,
    /// Tokens whose label is not [`IGNORE_INDEX`].
    pub labelled_tokens: usize,
    /// Tokens labelled `1`.
    pub positive_labels: usize,
    /// Length of the longest sentence.
    pub max_len: usize,
}

impl ShardSummary {
    /// Fold a slice of records into summary counts.
    pub fn from_records(records: &[TokenRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.records += 1;
            summary.tokens += record.len();
            summary.labelled_tokens += record.num_labelled();
            summary.positive_labels += record.labels.iter().filter(|&&l| l == 1).count();
            summary.max_len = summary.max_len.max(record.len());
        }
        summary
    }

    /// Fraction of labelled tokens that are positive. Zero when nothing is labelled.
    pub fn positive_rate(&self) -> f64 {
        if self.labelled_tokens == 0 {
            0.0
        } else {
            self.positive_labels as f64 / self.labelled_tokens as f64
        }
    }
}
