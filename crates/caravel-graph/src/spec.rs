//! Spec trees: JSON literals with holes referencing other resources'
//! outputs, and their resolution into provider-ready documents.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use caravel_value::{REDACTED_KEY, ValueCell, content_digest};
use serde_json::{Value as Json, json};
use thiserror::Error;

use crate::node::NodeId;

/// Reference to one output of another resource.
///
/// Embedding an OutputRef in a spec is what creates an implicit dependency
/// edge; the scheduler substitutes the resolved value right before the
/// consuming node's provider call.
#[derive(Clone)]
pub struct OutputRef {
  owner: NodeId,
  key: String,
  cell: Arc<ValueCell>,
}

impl OutputRef {
  pub(crate) fn new(owner: NodeId, key: &str, cell: Arc<ValueCell>) -> Self {
    Self {
      owner,
      key: key.to_string(),
      cell,
    }
  }

  pub fn owner(&self) -> &NodeId {
    &self.owner
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn cell(&self) -> &Arc<ValueCell> {
    &self.cell
  }
}

impl fmt::Debug for OutputRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutputRef")
      .field("owner", &self.owner.urn())
      .field("key", &self.key)
      .finish()
  }
}

impl fmt::Display for OutputRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.owner, self.key)
  }
}

/// A desired spec: a JSON tree whose leaves may be expressions over
/// not-yet-known outputs of other resources.
#[derive(Debug, Clone)]
pub enum SpecValue {
  Literal(Json),
  List(Vec<SpecValue>),
  Map(BTreeMap<String, SpecValue>),
  Ref(OutputRef),
}

impl From<Json> for SpecValue {
  fn from(value: Json) -> Self {
    Self::Literal(value)
  }
}

impl From<&str> for SpecValue {
  fn from(value: &str) -> Self {
    Self::Literal(Json::String(value.to_string()))
  }
}

impl From<String> for SpecValue {
  fn from(value: String) -> Self {
    Self::Literal(Json::String(value))
  }
}

impl From<bool> for SpecValue {
  fn from(value: bool) -> Self {
    Self::Literal(Json::Bool(value))
  }
}

impl From<i64> for SpecValue {
  fn from(value: i64) -> Self {
    Self::Literal(json!(value))
  }
}

impl From<u64> for SpecValue {
  fn from(value: u64) -> Self {
    Self::Literal(json!(value))
  }
}

impl From<OutputRef> for SpecValue {
  fn from(reference: OutputRef) -> Self {
    Self::Ref(reference)
  }
}

impl From<Vec<SpecValue>> for SpecValue {
  fn from(items: Vec<SpecValue>) -> Self {
    Self::List(items)
  }
}

impl<K: Into<String>> FromIterator<(K, SpecValue)> for SpecValue {
  fn from_iter<I: IntoIterator<Item = (K, SpecValue)>>(iter: I) -> Self {
    Self::Map(
      iter
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect(),
    )
  }
}

/// How unresolved references are treated during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
  /// Every reference must be resolved; failure is an engine error.
  Apply,
  /// Unresolved references substitute an unknown marker (planning only).
  Preview,
}

/// Marker substituted for an unresolved reference during preview.
pub fn unknown_marker() -> Json {
  json!({ "__unknown": true })
}

#[derive(Debug, Error)]
pub enum SpecError {
  /// A referenced output was unresolved when the node was dispatched.
  #[error("unresolved reference {reference}")]
  UnresolvedRef { reference: String },
}

/// A spec with every reference substituted.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
  doc: Json,
  secret_pointers: Vec<String>,
}

impl ResolvedSpec {
  /// The raw document, secrets revealed, as handed to providers.
  pub fn doc(&self) -> &Json {
    &self.doc
  }

  /// JSON pointers to fields whose value came from a Secret.
  pub fn secret_pointers(&self) -> &[String] {
    &self.secret_pointers
  }

  /// blake3 digest of the canonical document. Secrets hash raw, so an
  /// unchanged secret hashes identically across runs.
  pub fn hash(&self) -> String {
    content_digest(&self.doc)
  }

  /// The document with each secret-derived field replaced by a one-way
  /// digest marker. This is the form persisted to state and diffed against
  /// on later runs.
  pub fn redacted(&self) -> Json {
    let mut doc = self.doc.clone();
    for pointer in &self.secret_pointers {
      if let Some(slot) = doc.pointer_mut(pointer) {
        let digest = content_digest(slot);
        *slot = json!({ REDACTED_KEY: digest });
      }
    }
    doc
  }
}

impl SpecValue {
  /// Substitute every reference with its resolved value.
  pub fn resolve(&self, mode: ResolveMode) -> Result<ResolvedSpec, SpecError> {
    let mut secret_pointers = Vec::new();
    let doc = self.resolve_inner("", &mut secret_pointers, mode)?;
    Ok(ResolvedSpec {
      doc,
      secret_pointers,
    })
  }

  fn resolve_inner(
    &self,
    pointer: &str,
    secrets: &mut Vec<String>,
    mode: ResolveMode,
  ) -> Result<Json, SpecError> {
    match self {
      Self::Literal(value) => Ok(value.clone()),
      Self::List(items) => {
        let mut resolved = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
          resolved.push(item.resolve_inner(&format!("{pointer}/{index}"), secrets, mode)?);
        }
        Ok(Json::Array(resolved))
      }
      Self::Map(fields) => {
        let mut resolved = serde_json::Map::new();
        for (key, value) in fields {
          let child = format!("{pointer}/{}", escape_token(key));
          resolved.insert(key.clone(), value.resolve_inner(&child, secrets, mode)?);
        }
        Ok(Json::Object(resolved))
      }
      Self::Ref(reference) => match reference.cell().get() {
        Some(value) => {
          if value.is_secret() {
            secrets.push(pointer.to_string());
          }
          Ok(value.into_inner())
        }
        None => match mode {
          ResolveMode::Apply => Err(SpecError::UnresolvedRef {
            reference: reference.to_string(),
          }),
          ResolveMode::Preview => Ok(unknown_marker()),
        },
      },
    }
  }
}

/// RFC 6901 token escaping for JSON pointers.
fn escape_token(key: &str) -> String {
  key.replace('~', "~0").replace('/', "~1")
}
