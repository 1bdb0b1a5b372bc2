//! Columnar shard I/O for token classification data.
//!
//! Reads and writes sentences (token ids plus aligned per-token labels) as
//! Parquet or Arrow IPC files, and groups them into padded, token-budgeted
//! batches for training and evaluation.

pub mod batching;
pub mod reader;
pub mod types;
pub mod writer;

pub use batching::{BatchingConfig, EpochBatchIterator, TokenBatch};
pub use reader::{ShardError, ShardReader};
pub use types::{ShardFormat, ShardSummary, TokenRecord, IGNORE_INDEX};
pub use writer::ShardWriter;
