//! Writes TokenRecords to Parquet or Arrow IPC shard files.

use crate::types::{ShardFormat, TokenRecord};
use arrow::array::*;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::path::PathBuf;
use std::sync::Arc;

/// Arrow schema for token classification shards (2 list columns).
pub fn token_schema() -> Schema {
    let item = Arc::new(Field::new("item", DataType::Int64, true));
    Schema::new(vec![
        Field::new("input_ids", DataType::List(item.clone()), false),
        Field::new("labels", DataType::List(item), false),
    ])
}

/// Buffers token records and writes them to a single shard file.
pub struct ShardWriter {
    records: Vec<TokenRecord>,
    output_path: PathBuf,
    format: ShardFormat,
}

impl ShardWriter {
    /// Create a writer; the format is taken from the file extension and
    /// defaults to Parquet for unknown extensions.
    pub fn new(output_path: PathBuf) -> Self {
        let format = ShardFormat::from_path(&output_path).unwrap_or(ShardFormat::Parquet);
        Self {
            records: Vec::new(),
            output_path,
            format,
        }
    }

    /// Buffer a single record.
    pub fn record(&mut self, record: TokenRecord) {
        self.records.push(record);
    }

    /// Buffer multiple records.
    pub fn record_all(&mut self, records: Vec<TokenRecord>) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write all buffered records and return the output path.
    pub fn finish(self) -> anyhow::Result<PathBuf> {
        let schema = Arc::new(token_schema());

        let batch = if self.records.is_empty() {
            RecordBatch::new_empty(schema.clone())
        } else {
            build_record_batch(&self.records)?
        };

        let file = std::fs::File::create(&self.output_path)?;
        match self.format {
            ShardFormat::Parquet => {
                let mut writer = ArrowWriter::try_new(file, schema, None)?;
                writer.write(&batch)?;
                writer.close()?;
            }
            ShardFormat::Arrow => {
                let mut writer = StreamWriter::try_new(file, &schema)?;
                writer.write(&batch)?;
                writer.finish()?;
            }
        }

        tracing::info!(
            records = self.records.len(),
            format = %self.format,
            path = %self.output_path.display(),
            "Wrote token shard"
        );

        Ok(self.output_path)
    }
}

/// Build an Arrow RecordBatch from token records.
fn build_record_batch(records: &[TokenRecord]) -> anyhow::Result<RecordBatch> {
    let schema = Arc::new(token_schema());

    let mut ids_builder = ListBuilder::new(Int64Builder::new());
    let mut labels_builder = ListBuilder::new(Int64Builder::new());
    for r in records {
        anyhow::ensure!(
            r.input_ids.len() == r.labels.len(),
            "record has {} token ids but {} labels",
            r.input_ids.len(),
            r.labels.len()
        );
        ids_builder.values().append_slice(&r.input_ids);
        ids_builder.append(true);
        labels_builder.values().append_slice(&r.labels);
        labels_builder.append(true);
    }

    let columns: Vec<Arc<dyn arrow::array::Array>> = vec![
        Arc::new(ids_builder.finish()),
        Arc::new(labels_builder.finish()),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}
