use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Success,
    Failed,
    Info,
    Unknown,
}

/// One durable metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub ts: DateTime<Utc>,
    pub task: String,
    pub metric: String,
    pub value: f64,
    pub status: MetricStatus,
    pub host: String,
}

impl MetricRecord {
    pub fn new(task: &str, metric: &str, value: f64, status: MetricStatus, host: &str) -> Self {
        Self {
            ts: Utc::now().trunc_subsecs(0),
            task: task.to_string(),
            metric: metric.to_string(),
            value,
            status,
            host: host.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("writing metrics file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding metric record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only destination for metric records.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: &MetricRecord) -> Result<(), MetricsError>;
}

/// One JSON object per line, appended to a file that is created on first use.
#[derive(Debug)]
pub struct JsonlMetricsSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> MetricsError {
        MetricsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record(&self, record: &MetricRecord) -> Result<(), MetricsError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    records: Mutex<Vec<MetricRecord>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Values recorded for `task`/`metric`, oldest first.
    pub fn values(&self, task: &str, metric: &str) -> Vec<f64> {
        self.records()
            .into_iter()
            .filter(|r| r.task == task && r.metric == metric)
            .map(|r| r.value)
            .collect()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, record: &MetricRecord) -> Result<(), MetricsError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
