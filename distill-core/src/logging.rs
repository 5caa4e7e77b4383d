//! Tracing setup for binaries embedding the pipeline.
//!
//! Installs a human-readable stderr layer and, optionally, a JSON layer
//! written to a daily-rolling file.

use crate::error::{DistillError, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// 0 = info, 1 = debug, 2+ = trace. Ignored when `RUST_LOG` is set.
    pub verbosity: u8,
    /// Only errors on stderr.
    pub quiet: bool,
    /// Write JSON logs to a daily-rolling file.
    pub json_file: bool,
    /// Directory for the JSON log; defaults to the user data dir.
    pub log_dir: Option<PathBuf>,
}

impl LoggingOptions {
    fn stderr_level(&self) -> &'static str {
        match self.verbosity {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    fn resolve_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "distill", "distill")
                .map(|d| d.data_dir().join("logs"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

/// Install the global tracing subscriber.
///
/// Keep the returned guard alive for as long as file logs should be
/// flushed. Fails if a global subscriber is already set.
pub fn init_tracing(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.stderr_level()));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let (json_layer, guard) = if options.json_file {
        let log_dir = options.resolve_log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "distill.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| DistillError::Logging {
            message: e.to_string(),
        })?;
    Ok(guard)
}
