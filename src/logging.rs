use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Initialize file logging.
///
/// The terminal belongs to the UI, so events go to a daily rolling file.
/// `RUST_LOG` overrides the configured level. Keep the returned guard alive
/// for the lifetime of the program so buffered lines are flushed.
pub fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
  let directory = match &config.directory {
    Some(dir) => dir.clone(),
    None => default_log_dir()?,
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "corpex.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(format!("corpex={}", config.level)))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?;

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .with(filter)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("corpex").join("logs"))
}

#[cfg(test)]
mod tests {
  use super::*;

  // Installs the global subscriber, so this is the only test that may call
  // init_logging.
  #[test]
  fn test_init_logging_writes_to_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
      level: "debug".to_string(),
      directory: Some(dir.path().join("logs")),
    };

    let guard = init_logging(&config).unwrap();
    tracing::info!("logging initialized");
    drop(guard);

    let files: Vec<String> = std::fs::read_dir(dir.path().join("logs"))
      .unwrap()
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.file_name().to_string_lossy().into_owned())
      .collect();
    assert!(files.iter().any(|name| name.starts_with("corpex.log")));

    let again = init_logging(&config);
    assert!(again.is_err());
  }
}
