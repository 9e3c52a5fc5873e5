use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub slow_query: SlowQueryConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Corpora offered for selection
  pub corpora: Vec<String>,
  /// Simulated latency of match counting
  pub count_latency_ms: u64,
  /// Simulated latency of query node extraction
  pub node_latency_ms: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      corpora: vec![
        "pcc2".to_string(),
        "GUM".to_string(),
        "RIDGES_Herbology_Version9.0".to_string(),
        "dickens".to_string(),
      ],
      count_latency_ms: 1500,
      node_latency_ms: 150,
    }
  }
}

impl BackendConfig {
  pub fn count_latency(&self) -> Duration {
    Duration::from_millis(self.count_latency_ms)
  }

  pub fn node_latency(&self) -> Duration {
    Duration::from_millis(self.node_latency_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlowQueryConfig {
  /// How long a peer group may fetch before it is shown as slow
  pub timeout_ms: u64,
}

impl Default for SlowQueryConfig {
  fn default() -> Self {
    Self { timeout_ms: 500 }
  }
}

impl SlowQueryConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter level for the crate; RUST_LOG takes precedence
  pub level: String,
  /// Directory for log files (default: $XDG_DATA_HOME/corpex/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./corpex.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/corpex/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("corpex.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("corpex").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.backend.corpora.is_empty() {
      return Err(eyre!("backend.corpora must list at least one corpus"));
    }
    Ok(config)
  }
}
