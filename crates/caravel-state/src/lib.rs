//! Caravel State
//!
//! Recorded state: what was last applied per resource, persisted across
//! runs. Absence of a record means the resource is new.
//!
//! The [`Store`] trait defines load/put/remove; [`JsonFileStore`] is the
//! file-backed implementation with atomic rewrite, [`MemoryStore`] backs
//! tests and previews. A store that is not marked secure never receives raw
//! secret payloads - encoding is not redaction, only a one-way digest is.

mod error;
mod file;
mod memory;
mod record;

pub use error::StoreError;
pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use record::{RecordStatus, ResourceRecord, StateSnapshot, StoredValue};

use std::future::Future;

/// Persistence for recorded state.
///
/// The snapshot is read once at run start; records are rewritten atomically
/// as individual nodes complete, so a failed run leaves a parseable state
/// file containing every node that did complete.
pub trait Store: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Load the full snapshot.
  fn load(&self) -> impl Future<Output = Result<StateSnapshot, Self::Error>> + Send;

  /// Insert or overwrite one resource record.
  fn put(
    &self,
    urn: &str,
    record: ResourceRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Remove one resource record after deletion.
  fn remove(&self, urn: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Whether this store may hold raw secret payloads.
  ///
  /// Non-secure stores receive secrets as one-way digest markers instead;
  /// resources depending on such an output will see the marker, not the
  /// payload, on later runs.
  fn secure(&self) -> bool;
}
