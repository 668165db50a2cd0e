//! Plain and secret-tagged values.

use std::fmt;

use serde_json::Value as Json;

/// Fixed marker substituted for secret payloads in any formatted output.
pub const REDACTION_MARKER: &str = "[secret]";

/// Key under which a one-way digest stands in for a secret payload when it
/// has to be persisted by a store that is not marked secure.
pub const REDACTED_KEY: &str = "__redacted";

/// A resolved output value, optionally tagged secret.
///
/// A Secret behaves like a plain value in every respect except formatting:
/// Display and Debug never print the payload. Provider calls read the raw
/// payload through [`Value::reveal`].
#[derive(Clone, PartialEq)]
pub enum Value {
  Plain(Json),
  Secret(Json),
}

impl Value {
  pub fn plain(value: impl Into<Json>) -> Self {
    Self::Plain(value.into())
  }

  pub fn secret(value: impl Into<Json>) -> Self {
    Self::Secret(value.into())
  }

  pub fn is_secret(&self) -> bool {
    matches!(self, Self::Secret(_))
  }

  /// The raw payload, secret or not.
  pub fn reveal(&self) -> &Json {
    match self {
      Self::Plain(value) | Self::Secret(value) => value,
    }
  }

  pub fn into_inner(self) -> Json {
    match self {
      Self::Plain(value) | Self::Secret(value) => value,
    }
  }

  /// The payload with a secret replaced by the redaction marker.
  pub fn redacted(&self) -> Json {
    match self {
      Self::Plain(value) => value.clone(),
      Self::Secret(_) => Json::String(REDACTION_MARKER.to_string()),
    }
  }
}

impl From<Json> for Value {
  fn from(value: Json) -> Self {
    Self::Plain(value)
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Plain(Json::String(s)) => f.write_str(s),
      Self::Plain(value) => write!(f, "{value}"),
      Self::Secret(_) => f.write_str(REDACTION_MARKER),
    }
  }
}

impl fmt::Debug for Value {
  // Never expose a secret payload in debug output.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Plain(value) => f.debug_tuple("Plain").field(value).finish(),
      Self::Secret(_) => f.debug_tuple("Secret").field(&REDACTION_MARKER).finish(),
    }
  }
}

/// blake3 hex digest of a value's canonical JSON encoding.
///
/// serde_json orders object keys, so equal documents always digest equally.
pub fn content_digest(value: &Json) -> String {
  let bytes = serde_json::to_vec(value).unwrap_or_default();
  blake3::hash(&bytes).to_hex().to_string()
}
