//! Random secret generation adapter.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use caravel_graph::ResolvedSpec;
use caravel_value::Value;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use crate::{Outputs, Provider, ProviderError};

#[derive(Debug, Deserialize)]
struct RandomSpec {
  #[serde(default = "default_length")]
  length: usize,
  #[serde(default)]
  special: bool,
}

fn default_length() -> usize {
  16
}

const SPECIAL_CHARSET: &[u8] =
  b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%&*-_=+";

/// Generates a password from OS entropy and returns it as the Secret-tagged
/// `result` output.
///
/// Deleting a generated secret is a no-op, and outputs cannot be re-read:
/// `read` keeps whatever was recorded. Any spec change replaces the
/// resource, generating a fresh payload.
#[derive(Debug, Default)]
pub struct RandomProvider;

impl RandomProvider {
  pub const KIND: &'static str = "random";

  fn generate(length: usize, special: bool) -> Result<String, ProviderError> {
    let length = length.max(1);
    let mut entropy = vec![0u8; length];
    getrandom::getrandom(&mut entropy)
      .map_err(|err| ProviderError::failed(format!("entropy source failed: {err}")))?;

    if special {
      Ok(
        entropy
          .iter()
          .map(|byte| SPECIAL_CHARSET[*byte as usize % SPECIAL_CHARSET.len()] as char)
          .collect(),
      )
    } else {
      let mut encoded = URL_SAFE_NO_PAD.encode(&entropy);
      encoded.truncate(length);
      Ok(encoded)
    }
  }
}

#[async_trait]
impl Provider for RandomProvider {
  async fn create(
    &self,
    spec: &ResolvedSpec,
    _cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError> {
    let parsed: RandomSpec = serde_json::from_value(spec.doc().clone())
      .map_err(|err| ProviderError::invalid_spec(err.to_string()))?;
    let result = Self::generate(parsed.length, parsed.special)?;
    Ok(Outputs::from([(
      "result".to_string(),
      Value::secret(result),
    )]))
  }

  async fn delete(
    &self,
    _spec: &Json,
    _outputs: &Outputs,
    _cancel: CancellationToken,
  ) -> Result<(), ProviderError> {
    Ok(())
  }
}
