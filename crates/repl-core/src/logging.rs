//! Structured logging setup.
//!
//! Splits "what level" from "where/how rotated" the way the teacher's
//! `config::{LoggingConfig, FileLogConfig}` pair does: `tracing_subscriber`'s
//! `EnvFilter` drives the level, `tracing_appender::rolling` drives
//! rotation. The job descriptor's `options.log_directory` / `log_rotation`
//! / `log_level` keys feed this directly; `options.loki` is schema-validated
//! but has no shipping backend here (see `warn_if_loki_unsupported`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LogRotation, LokiConfig};

/// Holds the non-blocking writer guard for a file appender; dropping it
/// flushes and stops the background writer thread, so callers must keep it
/// alive for the process lifetime.
pub struct LoggingHandle {
    _file_guard: Option<WorkerGuard>,
}

/// Initializes the global tracing subscriber for one job-worker process.
/// `log_directory` is the job's own directory (the caller joins `job_name`
/// onto `options.log_directory` before calling this); when absent, logs go
/// to stderr only.
pub fn init(
    log_level: &str,
    log_directory: Option<&Path>,
    rotation: Option<&LogRotation>,
) -> LoggingHandle {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_directory {
        Some(dir) if rotation.map(|r| r.enabled).unwrap_or(true) => {
            let rotation = rotation.cloned().unwrap_or_default();
            let appender = rolling_appender(dir, &rotation);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();

            LoggingHandle {
                _file_guard: Some(guard),
            }
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            LoggingHandle { _file_guard: None }
        }
    }
}

fn rolling_appender(dir: &Path, rotation: &LogRotation) -> tracing_appender::rolling::RollingFileAppender {
    let rotation_kind = match rotation.when.as_str() {
        "minutely" => tracing_appender::rolling::Rotation::MINUTELY,
        "hourly" => tracing_appender::rolling::Rotation::HOURLY,
        "never" => tracing_appender::rolling::Rotation::NEVER,
        _ => tracing_appender::rolling::Rotation::DAILY,
    };
    tracing_appender::rolling::RollingFileAppender::new(rotation_kind, dir, "job.log")
}

/// `options.loki` is accepted and validated by the schema (see
/// `config::LokiConfig`) but there's no log-shipping backend wired in here.
/// Warn exactly once per process rather than silently dropping the setting.
pub fn warn_if_loki_unsupported(loki: Option<&LokiConfig>) {
    if loki.map(|l| l.enabled).unwrap_or(false) {
        tracing::warn!("options.loki.enabled=true but no log-shipping backend is configured; logs stay local");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loki_warning_is_a_noop_when_disabled() {
        warn_if_loki_unsupported(None);
        warn_if_loki_unsupported(Some(&LokiConfig::default()));
    }
}
