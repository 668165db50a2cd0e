//! In-memory store for tests.

use tokio::sync::Mutex;

use crate::Store;
use crate::error::StoreError;
use crate::record::{ResourceRecord, StateSnapshot};

/// Keeps the snapshot in memory only. Secure by default so secret outputs
/// survive between runs within a process.
#[derive(Default)]
pub struct MemoryStore {
  snapshot: Mutex<StateSnapshot>,
  insecure: bool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// A store that applies the digest-marker policy to secrets.
  pub fn insecure() -> Self {
    Self {
      snapshot: Mutex::new(StateSnapshot::default()),
      insecure: true,
    }
  }

  /// Seed the store with an existing snapshot.
  pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
    Self {
      snapshot: Mutex::new(snapshot),
      insecure: false,
    }
  }
}

impl Store for MemoryStore {
  type Error = StoreError;

  async fn load(&self) -> Result<StateSnapshot, StoreError> {
    Ok(self.snapshot.lock().await.clone())
  }

  async fn put(&self, urn: &str, record: ResourceRecord) -> Result<(), StoreError> {
    self
      .snapshot
      .lock()
      .await
      .resources
      .insert(urn.to_string(), record);
    Ok(())
  }

  async fn remove(&self, urn: &str) -> Result<(), StoreError> {
    self.snapshot.lock().await.resources.remove(urn);
    Ok(())
  }

  fn secure(&self) -> bool {
    !self.insecure
  }
}
