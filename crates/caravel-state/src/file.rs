//! File-backed store with atomic rewrite.

use std::path::PathBuf;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Store;
use crate::error::StoreError;
use crate::record::{ResourceRecord, StateSnapshot};

/// JSON state file, rewritten atomically (write-temp-then-rename) after
/// every record change.
///
/// A secure store holds raw secret outputs; the file mode is narrowed to
/// the owner accordingly.
pub struct JsonFileStore {
  path: PathBuf,
  secure: bool,
  snapshot: Mutex<StateSnapshot>,
}

impl JsonFileStore {
  /// Open or create the state file. An absent file starts empty.
  pub async fn open(path: impl Into<PathBuf>, secure: bool) -> Result<Self, StoreError> {
    let path = path.into();
    let snapshot = match fs::read(&path).await {
      Ok(bytes) => serde_json::from_slice(&bytes)?,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "state file absent, starting empty");
        StateSnapshot::default()
      }
      Err(err) => return Err(err.into()),
    };

    Ok(Self {
      path,
      secure,
      snapshot: Mutex::new(snapshot),
    })
  }

  pub fn path(&self) -> &std::path::Path {
    &self.path
  }

  async fn rewrite(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
    if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).await?;
      }
    }

    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let tmp = self.path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).await?;

    #[cfg(unix)]
    if self.secure {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    fs::rename(&tmp, &self.path).await?;
    Ok(())
  }
}

impl Store for JsonFileStore {
  type Error = StoreError;

  async fn load(&self) -> Result<StateSnapshot, StoreError> {
    Ok(self.snapshot.lock().await.clone())
  }

  async fn put(&self, urn: &str, record: ResourceRecord) -> Result<(), StoreError> {
    let mut snapshot = self.snapshot.lock().await;
    snapshot.resources.insert(urn.to_string(), record);
    self.rewrite(&snapshot).await
  }

  async fn remove(&self, urn: &str) -> Result<(), StoreError> {
    let mut snapshot = self.snapshot.lock().await;
    snapshot.resources.remove(urn);
    self.rewrite(&snapshot).await
  }

  fn secure(&self) -> bool {
    self.secure
  }
}
