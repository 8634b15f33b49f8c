//! Logging bootstrap, durable metrics, and the instrumented-call helper shared by every
//! pipeline stage.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, info_span, warn, Instrument};
use zre_storage::StorageError;

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogGuard};
pub use metrics::{
    JsonlMetricsSink, MemoryMetricsSink, MetricRecord, MetricStatus, MetricsError, MetricsSink,
};

pub const CRATE_NAME: &str = "zre-telemetry";

/// Best-effort host name for tagging log lines and metric records.
pub fn resolve_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Anything whose row count can be reported.
pub trait BatchSize {
    /// `None` when the size cannot be determined without consuming the batch.
    fn batch_size(&self) -> Option<usize>;
}

impl<T> BatchSize for [T] {
    fn batch_size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<T> BatchSize for Vec<T> {
    fn batch_size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<K, V> BatchSize for BTreeMap<K, V> {
    fn batch_size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<K, V, S> BatchSize for HashMap<K, V, S> {
    fn batch_size(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// A re-iterable batch that is only counted when asked.
#[derive(Debug, Clone)]
pub struct LazyBatch<I> {
    iter: I,
}

impl<I: Iterator + Clone> LazyBatch<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }

    pub fn into_inner(self) -> I {
        self.iter
    }
}

impl<I: Iterator + Clone> BatchSize for LazyBatch<I> {
    fn batch_size(&self) -> Option<usize> {
        Some(self.iter.clone().count())
    }
}

/// A one-shot stream; sized only when its `size_hint` is exact.
#[derive(Debug)]
pub struct StreamedBatch<I> {
    iter: I,
}

impl<I: Iterator> StreamedBatch<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }

    pub fn into_inner(self) -> I {
        self.iter
    }
}

impl<I: Iterator> BatchSize for StreamedBatch<I> {
    fn batch_size(&self) -> Option<usize> {
        match self.iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower),
            _ => None,
        }
    }
}

/// Logging and metric emission handle, built once at startup and passed to each stage.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn MetricsSink>,
    host: String,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").field("host", &self.host).finish()
    }
}

impl Telemetry {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            host: resolve_host(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Write one metric record. Sink failures are logged, never returned.
    pub fn emit(&self, task: &str, metric: &str, value: f64, status: MetricStatus) {
        let record = MetricRecord::new(task, metric, value, status, &self.host);
        if let Err(err) = self.sink.record(&record) {
            warn!(task, metric, error = %err, "failed to write metric record");
        }
    }

    pub fn count(&self, task: &str, metric: &str, n: usize) {
        self.emit(task, metric, n as f64, MetricStatus::Success);
    }

    /// Log and emit the size of `batch` as `row_count`.
    pub fn row_count<B: BatchSize + ?Sized>(&self, task: &str, batch: &B) -> Option<usize> {
        match batch.batch_size() {
            Some(n) => {
                info!(task, rows = n, "rowcount {task} = {n}");
                self.emit(task, "row_count", n as f64, MetricStatus::Success);
                Some(n)
            }
            None => {
                warn!(task, "rowcount {task} could not be determined");
                self.emit(task, "row_count", -1.0, MetricStatus::Unknown);
                None
            }
        }
    }

    /// Run `fut` as the named task: log start/finish/failure with duration and emit a
    /// `duration_sec` metric tagged `success` or `failed`.
    pub async fn run_task<T, F>(&self, task: &str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let span = info_span!("task", task, host = %self.host);
        async move {
            let started = Instant::now();
            info!("{task} started");
            let outcome = fut.await;
            let duration_sec = round_millis(started.elapsed().as_secs_f64());
            match outcome {
                Ok(value) => {
                    info!(duration_sec, "{task} finished in {duration_sec:.2}s");
                    self.emit(task, "duration_sec", duration_sec, MetricStatus::Success);
                    Ok(value)
                }
                Err(err) => {
                    if is_storage_failure(&err) {
                        error!(duration_sec, error = ?err, "{task} failed: {err:#}");
                    } else {
                        error!(severity = "critical", duration_sec, error = ?err, "{task} failed: {err:#}");
                    }
                    self.emit(task, "duration_sec", duration_sec, MetricStatus::Failed);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Storage failures are expected operational errors; anything else is unclassified.
pub fn is_storage_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<StorageError>().is_some())
}

fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}
