//! Provider errors.

use thiserror::Error;

/// Failure of a single provider operation.
///
/// The engine tags these with the owning resource when reporting; a
/// provider failure never aborts sibling branches.
#[derive(Debug, Error)]
pub enum ProviderError {
  /// The kind does not implement this operation.
  #[error("{operation} is not supported by this resource kind")]
  Unsupported { operation: &'static str },

  /// The spec document did not match the kind's schema.
  #[error("invalid spec: {message}")]
  InvalidSpec { message: String },

  /// The operation observed the cancellation signal and stopped early.
  #[error("operation cancelled")]
  Cancelled,

  /// The external system rejected or failed the operation.
  #[error("{message}")]
  Failed { message: String },

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl ProviderError {
  pub fn invalid_spec(message: impl Into<String>) -> Self {
    Self::InvalidSpec {
      message: message.into(),
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
    }
  }
}
