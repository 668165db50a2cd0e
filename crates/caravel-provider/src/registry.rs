//! Provider registry: one adapter per resource kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::CommandProvider;
use crate::random::RandomProvider;
use crate::Provider;

/// Maps resource kinds to their adapters for one run.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
  providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in `command` and `random` kinds.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(CommandProvider::KIND, Arc::new(CommandProvider));
    registry.register(RandomProvider::KIND, Arc::new(RandomProvider));
    registry
  }

  pub fn register(&mut self, kind: &str, provider: Arc<dyn Provider>) {
    self.providers.insert(kind.to_string(), provider);
  }

  pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
    self.providers.get(kind).cloned()
  }

  pub fn contains(&self, kind: &str) -> bool {
    self.providers.contains_key(kind)
  }
}
