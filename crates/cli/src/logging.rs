//! Logging utilities for CLI commands and daemon

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use unpacker::config::DaemonConfig;

const LOG_FILE: &str = "image-unpacker.log";

/// Directory the background daemon logs into
pub fn log_dir() -> PathBuf {
  unpacker::dirs::default_log_dir()
}

/// Initialize logging for CLI commands (console only, warnings and up)
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_writer(std::io::stderr)
    .init();
}

fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging for the daemon.
///
/// In foreground mode: Logs to console only with colors
/// In background mode: Logs to a rolling file only (no ANSI)
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_daemon_logging(foreground: bool, settings: &DaemonConfig) -> Option<WorkerGuard> {
  // RUST_LOG overrides the configured level
  let env_filter = EnvFilter::builder()
    .with_default_directive(parse_log_level(&settings.log_level).into())
    .from_env_lossy();

  if foreground {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let log_dir = log_dir();
  if std::fs::create_dir_all(&log_dir).is_err() {
    init_cli_logging();
    return None;
  }

  let file_appender = match settings.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(&log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(&log_dir, LOG_FILE),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
