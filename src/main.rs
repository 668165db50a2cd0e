use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use caravel_engine::{EngineError, PreviewReport, RunOptions, RunReport, Scheduler};
use caravel_provider::ProviderRegistry;
use caravel_state::JsonFileStore;

mod program;

/// Caravel - a dependency-ordered deployment engine
#[derive(Parser)]
#[command(name = "caravel")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the state file (default: ~/.caravel/state.json)
  #[arg(long, global = true)]
  state: Option<PathBuf>,

  /// Maximum provider calls in flight at once
  #[arg(long, global = true, default_value_t = 4)]
  parallel: usize,

  /// Persist secret outputs as one-way digests instead of raw payloads.
  /// Dependents of a secret will see the digest marker on later runs.
  #[arg(long, global = true)]
  insecure_state: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Apply the deployment: create, update or replace every declared resource
  Up {
    /// Refresh unchanged resources through the provider's read
    #[arg(long)]
    refresh: bool,
  },

  /// Delete every recorded resource, dependents first
  Destroy,

  /// Show the planned action per resource without any provider call
  Preview,
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let rt = match tokio::runtime::Runtime::new() {
    Ok(rt) => rt,
    Err(err) => {
      eprintln!("error: failed to start runtime: {err}");
      return ExitCode::from(2);
    }
  };

  match rt.block_on(run(cli)) {
    Ok(code) => code,
    Err(err) => {
      eprintln!("error: {err:#}");
      ExitCode::from(2)
    }
  }
}

async fn run(cli: Cli) -> Result<ExitCode> {
  let state_path = cli.state.unwrap_or_else(default_state_path);
  let store = JsonFileStore::open(&state_path, !cli.insecure_state)
    .await
    .with_context(|| format!("failed to open state file: {}", state_path.display()))?;

  let cancel = CancellationToken::new();
  let interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      eprintln!("interrupt received, finishing in-flight operations");
      interrupt.cancel();
    }
  });

  let options = RunOptions {
    parallelism: cli.parallel.max(1),
    refresh: matches!(cli.command, Commands::Up { refresh: true }),
    cancel,
  };
  let engine = Scheduler::new(ProviderRegistry::with_defaults(), store, options);

  match cli.command {
    Commands::Up { .. } => {
      let graph = program::deployment().context("failed to build deployment graph")?;
      let report = match engine.apply(&graph).await {
        Ok(report) => report,
        Err(err) => return Ok(engine_error_exit(&err)),
      };
      print_run_report("up", &report);
      Ok(run_exit(&report))
    }
    Commands::Destroy => {
      let report = match engine.destroy().await {
        Ok(report) => report,
        Err(err) => return Ok(engine_error_exit(&err)),
      };
      print_run_report("destroy", &report);
      Ok(run_exit(&report))
    }
    Commands::Preview => {
      let graph = program::deployment().context("failed to build deployment graph")?;
      let preview = match engine.preview(&graph).await {
        Ok(preview) => preview,
        Err(err) => return Ok(engine_error_exit(&err)),
      };
      print_preview(&preview);
      Ok(if preview.errors.is_empty() {
        ExitCode::SUCCESS
      } else {
        ExitCode::from(1)
      })
    }
  }
}

fn default_state_path() -> PathBuf {
  dirs::home_dir()
    .map(|home| home.join(".caravel").join("state.json"))
    .unwrap_or_else(|| PathBuf::from("caravel-state.json"))
}

fn engine_error_exit(err: &EngineError) -> ExitCode {
  eprintln!("error: {err}");
  if err.is_static() {
    ExitCode::from(2)
  } else {
    ExitCode::from(1)
  }
}

fn run_exit(report: &RunReport) -> ExitCode {
  if report.success() {
    ExitCode::SUCCESS
  } else {
    ExitCode::from(1)
  }
}

fn print_run_report(verb: &str, report: &RunReport) {
  println!();
  if report.success() {
    println!("{verb} complete");
  } else {
    println!("{verb} finished with errors");
  }
  if !report.applied.is_empty() {
    println!("  applied ({}):", report.applied.len());
    for urn in &report.applied {
      println!("    + {urn}");
    }
  }
  if !report.unchanged.is_empty() {
    println!("  unchanged: {}", report.unchanged.len());
  }
  if !report.deleted.is_empty() {
    println!("  deleted ({}):", report.deleted.len());
    for urn in &report.deleted {
      println!("    - {urn}");
    }
  }
  for failure in &report.failed {
    println!("  failed: {} ({})", failure.urn, failure.error);
  }
  for urn in &report.blocked {
    println!("  blocked: {urn} (skipped due to upstream failure)");
  }
  if !report.skipped.is_empty() {
    println!("  skipped: {} (run cancelled)", report.skipped.len());
  }
  if !report.exports.is_empty() {
    println!("  outputs:");
    for (name, value) in &report.exports {
      println!("    {name} = {value}");
    }
  }
}

fn print_preview(preview: &PreviewReport) {
  println!();
  println!("planned actions:");
  for planned in &preview.actions {
    println!("  {} -> {}", planned.urn, planned.action);
  }
  for failure in &preview.errors {
    println!("  {} -> error: {}", failure.urn, failure.error);
  }
}
