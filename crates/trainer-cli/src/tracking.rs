//! Experiment tracking sinks.
//!
//! A run logs its configuration once, then one set of metrics per epoch
//! keyed by a zero-based step. `JsonlRunLog` keeps a local record of the
//! run; `TracingSink` mirrors everything into the structured log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Destination for run configuration and per-step metrics.
pub trait MetricSink {
    fn log_config(&mut self, run: &RunInfo) -> anyhow::Result<()>;
    fn log(&mut self, metrics: &[(&str, f64)], step: usize) -> anyhow::Result<()>;
}

/// Run identity and configuration, logged once at start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInfo {
    pub project: String,
    pub name: String,
    pub job_type: String,
    pub notes: String,
    pub config: serde_json::Value,
}

/// One line of a JSONL run log.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Config(RunInfo),
    Metrics {
        step: usize,
        values: serde_json::Map<String, serde_json::Value>,
    },
}

/// Appends one JSON object per event to a local file.
pub struct JsonlRunLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlRunLog {
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .map_err(|e| anyhow::anyhow!("Failed to create run log {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "Writing run log");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &RunEvent) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Parse every event of an existing run log.
    pub fn read_events(path: &Path) -> anyhow::Result<Vec<RunEvent>> {
        let contents = std::fs::read_to_string(path)?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<RunEvent>(l).map_err(anyhow::Error::from))
            .collect()
    }
}

impl MetricSink for JsonlRunLog {
    fn log_config(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        self.write_event(&RunEvent::Config(run.clone()))
    }

    fn log(&mut self, metrics: &[(&str, f64)], step: usize) -> anyhow::Result<()> {
        let values = metrics
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect();
        self.write_event(&RunEvent::Metrics { step, values })
    }
}

/// Emits run events as `info` logs.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_config(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        tracing::info!(
            project = %run.project,
            name = %run.name,
            job_type = %run.job_type,
            notes = %run.notes,
            config = %run.config,
            "Run started"
        );
        Ok(())
    }

    fn log(&mut self, metrics: &[(&str, f64)], step: usize) -> anyhow::Result<()> {
        let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        tracing::info!(step, "{}", rendered.join(" "));
        Ok(())
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricSink for FanoutSink {
    fn log_config(&mut self, run: &RunInfo) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            sink.log_config(run)?;
        }
        Ok(())
    }

    fn log(&mut self, metrics: &[(&str, f64)], step: usize) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            sink.log(metrics, step)?;
        }
        Ok(())
    }
}
