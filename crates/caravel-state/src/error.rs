//! Storage errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("state io failed: {0}")]
  Io(#[from] std::io::Error),

  #[error("state (de)serialization failed: {0}")]
  Serde(#[from] serde_json::Error),
}
