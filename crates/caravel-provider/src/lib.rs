//! Caravel Provider
//!
//! The provider adapter contract. Each resource kind implements
//! create/read/update/delete against its external system; adapters are the
//! only place side effects happen, the engine core never talks to an
//! external system directly.
//!
//! Two built-in kinds ship with the engine: [`CommandProvider`] runs local
//! shell commands, and [`RandomProvider`] generates secret payloads from OS
//! entropy.

mod command;
mod error;
mod random;
mod registry;

pub use command::CommandProvider;
pub use error::ProviderError;
pub use random::RandomProvider;
pub use registry::ProviderRegistry;

use std::collections::HashMap;

use async_trait::async_trait;
use caravel_graph::ResolvedSpec;
use caravel_value::Value;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

/// Outputs returned by a provider operation. Entries may be Secret-tagged;
/// the engine applies the redaction policy, not the adapter.
pub type Outputs = HashMap<String, Value>;

/// How a resource kind handles a spec change that cannot be updated in
/// place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replacement {
  /// Create the replacement first, then delete the old resource, avoiding
  /// an availability gap.
  #[default]
  CreateBeforeDelete,
  /// Delete first; for kinds whose instances cannot coexist, such as
  /// singleton names scoped to a whole cluster.
  DeleteBeforeCreate,
  /// The kind cannot be replaced at all.
  Forbidden,
}

/// Per-kind declaration of which spec fields update in place and how
/// replacement is ordered.
#[derive(Debug, Clone, Default)]
pub struct DiffPolicy {
  /// Top-level spec fields `update` can change without a replacement.
  pub updatable_fields: Vec<String>,
  pub replacement: Replacement,
}

impl DiffPolicy {
  pub fn updatable<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      updatable_fields: fields.into_iter().map(Into::into).collect(),
      replacement: Replacement::default(),
    }
  }

  pub fn replace_only(replacement: Replacement) -> Self {
    Self {
      updatable_fields: Vec::new(),
      replacement,
    }
  }
}

/// One resource kind's lifecycle operations.
///
/// Every operation receives a best-effort cancellation token; the engine
/// awaits in-flight calls to completion regardless, so honoring the token
/// is optional. Each operation is invoked at most once per node per run -
/// the engine provides no retry semantics.
#[async_trait]
pub trait Provider: Send + Sync {
  /// Create the resource described by `spec` and return its outputs.
  async fn create(
    &self,
    spec: &ResolvedSpec,
    cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError>;

  /// Refresh outputs for an unchanged resource. The default returns the
  /// recorded outputs untouched, for kinds whose outputs cannot be
  /// re-read.
  async fn read(
    &self,
    outputs: &Outputs,
    _cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError> {
    Ok(outputs.clone())
  }

  /// Update the resource in place. Only invoked when every changed field
  /// is declared updatable by [`Provider::diff_policy`].
  async fn update(
    &self,
    _old_spec: &Json,
    _new_spec: &ResolvedSpec,
    _old_outputs: &Outputs,
    _cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError> {
    Err(ProviderError::Unsupported {
      operation: "update",
    })
  }

  /// Delete the resource.
  async fn delete(
    &self,
    spec: &Json,
    outputs: &Outputs,
    cancel: CancellationToken,
  ) -> Result<(), ProviderError>;

  /// Which fields update in place and how replacement is ordered.
  fn diff_policy(&self) -> DiffPolicy {
    DiffPolicy::default()
  }
}
