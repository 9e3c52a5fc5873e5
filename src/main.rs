mod app;
mod commands;
mod event;
mod ui;

use clap::Parser;
use color_eyre::Result;
use corpex::config::Config;
use corpex::logging;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "corpex")]
#[command(about = "A terminal front end for counting corpus query matches")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/corpex/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Milliseconds a request group may run before it is shown as slow
  #[arg(short, long)]
  timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(timeout_ms) = args.timeout_ms {
    config.slow_query.timeout_ms = timeout_ms;
  }

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = logging::init_logging(&config.log)?;
  info!(
    corpora = config.backend.corpora.len(),
    timeout_ms = config.slow_query.timeout_ms,
    "Starting corpex"
  );

  let mut app = app::App::new(config)?;
  app.run().await?;

  Ok(())
}
