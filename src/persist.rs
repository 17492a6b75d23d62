//! Key-value persistence for rule storage and settings
//!
//! Values are opaque JSON blobs. [`JsonFileStore`] keeps one file per key and
//! replaces it atomically; [`MemoryStore`] backs tests and ephemeral runs.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Blob storage addressed by key
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Value>>;
  fn set(&self, key: &str, value: &Value) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Value>> {
    Ok(self.values.lock().get(key).cloned())
  }

  fn set(&self, key: &str, value: &Value) -> Result<()> {
    self.values.lock().insert(key.to_string(), value.clone());
    Ok(())
  }
}

/// One `<key>.json` file per key under a directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
  dir: PathBuf,
}

impl JsonFileStore {
  pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)
      .map_err(|e| Error::storage_error(format!("cannot create {}: {}", dir.display(), e)))?;
    Ok(Self { dir })
  }

  fn path(&self, key: &str) -> Result<PathBuf> {
    let valid = !key.is_empty()
      && key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
      return Err(Error::storage_error(format!("invalid storage key {:?}", key)));
    }
    Ok(self.dir.join(format!("{}.json", key)))
  }
}

impl KeyValueStore for JsonFileStore {
  fn get(&self, key: &str) -> Result<Option<Value>> {
    let path = self.path(key)?;
    let raw = match std::fs::read(&path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(Error::storage_error(format!(
          "cannot read {}: {}",
          path.display(),
          e
        )))
      }
    };
    Ok(Some(serde_json::from_slice(&raw)?))
  }

  fn set(&self, key: &str, value: &Value) -> Result<()> {
    let path = self.path(key)?;
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, raw)
      .and_then(|_| std::fs::rename(&tmp, &path))
      .map_err(|e| Error::storage_error(format!("cannot write {}: {}", path.display(), e)))
  }
}
