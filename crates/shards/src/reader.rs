//! Reads TokenRecords from Parquet and Arrow IPC shard files.

use crate::types::{ShardFormat, ShardSummary, TokenRecord};
use arrow::array::*;
use arrow::datatypes::{DataType, Field};
use arrow::error::ArrowError;
use arrow::ipc::reader::{FileReader, StreamReader};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes opening an Arrow IPC *file* (as opposed to a bare stream).
const ARROW_FILE_MAGIC: &[u8; 6] = b"ARROW1";

/// Schema problems found while decoding a shard.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// A required column is absent.
    #[error("column `{0}` not found in shard")]
    MissingColumn(&'static str),
    /// A column exists but is not a list of integers.
    #[error("column `{column}` has type {found}, expected a list of integers")]
    UnexpectedType { column: &'static str, found: DataType },
    /// Token ids and labels of one row disagree in length.
    #[error("row {row}: {ids} token ids but {labels} labels")]
    LengthMismatch { row: usize, ids: usize, labels: usize },
}

/// Static methods for reading token shards.
pub struct ShardReader;

impl ShardReader {
    /// Read every record from one shard. The format is inferred from the
    /// extension; unknown extensions are read as Parquet.
    pub fn read_all(path: &Path) -> anyhow::Result<Vec<TokenRecord>> {
        let format = ShardFormat::from_path(path).unwrap_or(ShardFormat::Parquet);
        let batches = match format {
            ShardFormat::Parquet => read_parquet_batches(path)?,
            ShardFormat::Arrow => read_ipc_batches(path)?,
        };

        let mut records = Vec::new();
        for batch in &batches {
            let mut batch_records = extract_records_from_batch(batch)?;
            records.append(&mut batch_records);
        }

        tracing::debug!(
            count = records.len(),
            format = %format,
            path = %path.display(),
            "Read token shard"
        );

        Ok(records)
    }

    /// Read records from several shards, in the given order.
    pub fn read_multiple(paths: &[PathBuf]) -> anyhow::Result<Vec<TokenRecord>> {
        let mut all_records = Vec::new();
        for path in paths {
            let mut records = Self::read_all(path)?;
            all_records.append(&mut records);
        }
        Ok(all_records)
    }

    /// Compute summary statistics over several shards.
    pub fn read_summary(paths: &[PathBuf]) -> anyhow::Result<ShardSummary> {
        let records = Self::read_multiple(paths)?;
        Ok(ShardSummary::from_records(&records))
    }

    /// List the shard files in `dir` whose extension equals `extension`
    /// (without the leading dot), sorted by file name.
    pub fn list_shards(dir: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("Failed to list {}: {e}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn read_parquet_batches(path: &Path) -> anyhow::Result<Vec<RecordBatch>> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batches = reader.collect::<Result<Vec<_>, ArrowError>>()?;
    Ok(batches)
}

/// Arrow IPC shards come in two flavours: the random-access file format
/// (starts with `ARROW1`) and the streaming format written by most dataset
/// tooling. Sniff the header and pick the matching reader.
fn read_ipc_batches(path: &Path) -> anyhow::Result<Vec<RecordBatch>> {
    let mut header = [0u8; 6];
    let is_file_format = {
        let mut f = std::fs::File::open(path)?;
        f.read(&mut header)? == header.len() && &header == ARROW_FILE_MAGIC
    };

    let file = std::fs::File::open(path)?;
    let batches = if is_file_format {
        FileReader::try_new(file, None)?.collect::<Result<Vec<_>, ArrowError>>()?
    } else {
        StreamReader::try_new(BufReader::new(file), None)?
            .collect::<Result<Vec<_>, ArrowError>>()?
    };
    Ok(batches)
}

/// Fetch a list-of-integers column by name and normalize it to `List<Int64>`.
fn int_list_column(batch: &RecordBatch, name: &'static str) -> anyhow::Result<ListArray> {
    let column = batch
        .column_by_name(name)
        .ok_or(ShardError::MissingColumn(name))?;

    let is_int_list = match column.data_type() {
        DataType::List(f) | DataType::LargeList(f) => f.data_type().is_integer(),
        _ => false,
    };
    if !is_int_list {
        return Err(ShardError::UnexpectedType {
            column: name,
            found: column.data_type().clone(),
        }
        .into());
    }

    let target = DataType::List(Arc::new(Field::new("item", DataType::Int64, true)));
    let casted = arrow::compute::cast(column, &target)?;
    let list = casted
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| anyhow::anyhow!("Column `{name}` is not a ListArray after cast"))?
        .clone();
    Ok(list)
}

fn list_row(list: &ListArray, row: usize) -> anyhow::Result<Vec<i64>> {
    if list.is_null(row) {
        return Ok(Vec::new());
    }
    let values = list.value(row);
    let ints = values
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| anyhow::anyhow!("List values are not Int64Array"))?;
    Ok(ints.values().to_vec())
}

/// Extract token records from a single Arrow RecordBatch.
fn extract_records_from_batch(batch: &RecordBatch) -> anyhow::Result<Vec<TokenRecord>> {
    let input_ids = int_list_column(batch, "input_ids")?;
    let labels = int_list_column(batch, "labels")?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let ids = list_row(&input_ids, i)?;
        let labs = list_row(&labels, i)?;
        if ids.len() != labs.len() {
            return Err(ShardError::LengthMismatch {
                row: i,
                ids: ids.len(),
                labels: labs.len(),
            }
            .into());
        }
        records.push(TokenRecord::new(ids, labs));
    }

    Ok(records)
}
