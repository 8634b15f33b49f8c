use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub max_files: usize,
    /// Used when `RUST_LOG` is unset or unparsable.
    pub default_directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "etl_pipeline".to_string(),
            max_files: 5,
            default_directive: "info".to_string(),
        }
    }
}

/// Keeps the non-blocking file writer flushing; drop it only at process exit.
#[must_use = "dropping the guard stops the log file writer"]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
    already_initialized: bool,
}

impl LogGuard {
    pub fn already_initialized(&self) -> bool {
        self.already_initialized
    }
}

/// Install the process-wide subscriber: rolling file plus stdout.
///
/// Calling this again after a subscriber is installed does nothing and returns a guard
/// with [`LogGuard::already_initialized`] set.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LogGuard> {
    if tracing::dispatcher::has_been_set() {
        return Ok(LogGuard {
            _worker: None,
            already_initialized: true,
        });
    }

    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("creating log directory {}", config.dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files.max(1))
        .build(&config.dir)
        .with_context(|| format!("opening rolling log in {}", config.dir.display()))?;
    let (file_writer, worker) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    Ok(LogGuard {
        already_initialized: installed.is_err(),
        _worker: Some(worker),
    })
}
