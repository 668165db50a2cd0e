//! Local command adapter: shell commands for create and delete, stdout
//! captured as an output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use caravel_graph::ResolvedSpec;
use caravel_value::Value;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{DiffPolicy, Outputs, Provider, ProviderError, Replacement};

#[derive(Debug, Deserialize)]
struct CommandSpec {
  create: String,
  #[serde(default)]
  delete: Option<String>,
  /// Interpreter argv prefix, default `["/bin/sh", "-c"]`.
  #[serde(default)]
  interpreter: Option<Vec<String>>,
  #[serde(default)]
  env: BTreeMap<String, String>,
  #[serde(default)]
  dir: Option<PathBuf>,
}

impl CommandSpec {
  fn from_doc(doc: &Json) -> Result<Self, ProviderError> {
    serde_json::from_value(doc.clone()).map_err(|err| ProviderError::invalid_spec(err.to_string()))
  }
}

/// Runs local shell commands.
///
/// The `create` command's trimmed stdout becomes the `stdout` output.
/// `delete` is optional; a deleted resource without a delete command is
/// simply forgotten. Commands whose names collide system-wide (a cluster
/// singleton, say) cannot coexist, so replacement deletes before creating.
#[derive(Debug, Default)]
pub struct CommandProvider;

impl CommandProvider {
  pub const KIND: &'static str = "command";

  async fn run(
    spec: &CommandSpec,
    script: &str,
    cancel: CancellationToken,
  ) -> Result<String, ProviderError> {
    let interpreter = spec
      .interpreter
      .clone()
      .unwrap_or_else(|| vec!["/bin/sh".to_string(), "-c".to_string()]);
    let (program, args) = interpreter
      .split_first()
      .ok_or_else(|| ProviderError::invalid_spec("interpreter must not be empty"))?;

    let mut command = Command::new(program);
    command
      .args(args)
      .arg(script)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    for (key, value) in &spec.env {
      command.env(key, value);
    }
    if let Some(dir) = &spec.dir {
      command.current_dir(dir);
    }

    debug!(script, "running command");
    let child = command.spawn()?;

    // Dropping the in-flight future on cancellation kills the child.
    let output = tokio::select! {
      output = child.wait_with_output() => output?,
      () = cancel.cancelled() => return Err(ProviderError::Cancelled),
    };

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(ProviderError::failed(format!(
        "command exited with {}: {}",
        output.status,
        stderr.trim()
      )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
  }
}

#[async_trait]
impl Provider for CommandProvider {
  async fn create(
    &self,
    spec: &ResolvedSpec,
    cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError> {
    let parsed = CommandSpec::from_doc(spec.doc())?;
    let stdout = Self::run(&parsed, &parsed.create, cancel).await?;
    Ok(Outputs::from([(
      "stdout".to_string(),
      Value::plain(stdout),
    )]))
  }

  async fn delete(
    &self,
    spec: &Json,
    _outputs: &Outputs,
    cancel: CancellationToken,
  ) -> Result<(), ProviderError> {
    let parsed = CommandSpec::from_doc(spec)?;
    match &parsed.delete {
      Some(script) => Self::run(&parsed, script, cancel).await.map(|_| ()),
      None => Ok(()),
    }
  }

  fn diff_policy(&self) -> DiffPolicy {
    DiffPolicy::replace_only(Replacement::DeleteBeforeCreate)
  }
}
