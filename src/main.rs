mod demo;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use dashsync::{config::Config, QueryCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dashsync")]
#[command(about = "Drive the dashboard sync core against a simulated backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Polls an export job spends in each active status
  #[arg(long, default_value_t = 2)]
  job_steps: u32,

  /// Make the activity feed fail so the detail panel degrades
  #[arg(long)]
  fail_aux: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let cache = QueryCache::new(config.cache_config());
  let backend = Arc::new(demo::Backend::seeded(args.job_steps, args.fail_aux));

  let summary = demo::run_session(&cache, backend, config.poll_interval()).await?;
  info!(entries = cache.len(), "session finished");
  cache.dispose();

  println!("product:   {}", summary.detail.product.name);
  println!("tasks:     {}", summary.tasks_after_create.len());
  if !summary.detail.degraded.is_empty() {
    println!("degraded:  {}", summary.detail.degraded.join(", "));
  }
  println!("refetch:   {:?}", summary.transitions);
  println!(
    "export:    {} {:?} {}",
    summary.export.id,
    summary.export.status,
    summary
      .export
      .result
      .as_ref()
      .map(|r| r.to_string())
      .unwrap_or_default()
  );

  Ok(())
}

/// Log to stderr, or to `log_file` through a non-blocking writer whose guard
/// must outlive the session.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dashsync=info"));

  match log_file {
    Some(path) => {
      let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}
