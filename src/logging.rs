//! Tracing setup for the `hoard` binary.
//!
//! Everything at the `RUST_LOG` level (default `info`) goes to a daily log
//! file in the data directory; warnings and errors also go to stderr.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "hoard.log";

/// Default log directory: `$XDG_DATA_HOME/hoard/logs`.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("hoard").join("logs"))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(LevelFilter::WARN);

  let (file_layer, guard) = match log_dir {
    Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(filter);
      (Some(layer), Some(guard))
    }
    _ => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
