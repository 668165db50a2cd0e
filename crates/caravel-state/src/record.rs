//! Recorded state types.

use std::collections::BTreeMap;

use caravel_value::{REDACTED_KEY, Value, content_digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One stored output value.
///
/// Secrets are stored raw only by a secure store; otherwise a one-way
/// digest marker stands in, so a state file never leaks payloads while
/// later runs can still detect that the secret changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
  Secret {
    #[serde(rename = "__secret")]
    secret: Json,
  },
  Redacted {
    #[serde(rename = "__redacted")]
    digest: String,
  },
  Plain(Json),
}

impl StoredValue {
  /// Encode one output under the store's secret policy.
  pub fn encode(value: &Value, secure: bool) -> Self {
    match value {
      Value::Secret(raw) if secure => Self::Secret { secret: raw.clone() },
      Value::Secret(raw) => Self::Redacted {
        digest: content_digest(raw),
      },
      Value::Plain(raw) => Self::Plain(raw.clone()),
    }
  }

  /// Decode back into a runtime value.
  ///
  /// A redacted entry decodes to a Secret holding the marker object, not
  /// the original payload - the payload is gone by design of the store.
  pub fn decode(&self) -> Value {
    match self {
      Self::Secret { secret } => Value::Secret(secret.clone()),
      Self::Redacted { digest } => {
        Value::Secret(serde_json::json!({ REDACTED_KEY: digest }))
      }
      Self::Plain(raw) => Value::Plain(raw.clone()),
    }
  }
}

/// Terminal status recorded for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
  Applied,
  /// A destroy-path delete failed; the resource still exists and the run
  /// ended partially destroyed.
  Failed,
}

/// Last-applied state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
  pub kind: String,
  /// Last-applied spec document. Secret-derived fields always carry digest
  /// markers here, whatever the store policy; raw secrets live only in
  /// `outputs` of a secure store.
  pub spec: Json,
  pub spec_hash: String,
  pub outputs: BTreeMap<String, StoredValue>,
  /// Urns this resource depends on. Destroy runs rebuild their graph from
  /// these, so destroy keeps working after the program text changed.
  #[serde(default)]
  pub dependencies: Vec<String>,
  pub status: RecordStatus,
  pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
  /// Outputs decoded into runtime values.
  pub fn decoded_outputs(&self) -> Vec<(String, Value)> {
    self
      .outputs
      .iter()
      .map(|(key, value)| (key.clone(), value.decode()))
      .collect()
  }
}

/// Everything recorded across runs, keyed by resource urn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
  #[serde(default)]
  pub resources: BTreeMap<String, ResourceRecord>,
}

impl StateSnapshot {
  pub fn get(&self, urn: &str) -> Option<&ResourceRecord> {
    self.resources.get(urn)
  }

  pub fn is_empty(&self) -> bool {
    self.resources.is_empty()
  }
}
