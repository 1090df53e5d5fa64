// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjstoreError {
  #[error("object {0:?} not found")]
  NotFound(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

//
// Bucket
//

// Consumer-side contract against object storage. The ruler is write-mostly: the shipper uploads
// block files and only reads back for verification and tests.
#[async_trait]
pub trait Bucket: Send + Sync {
  // Provider name, used in logs and to key test skipping.
  fn name(&self) -> &'static str;

  // Write an object under the given key, replacing any existing object. Writes are idempotent
  // by key.
  async fn upload(&self, key: &str, data: Bytes) -> Result<(), ObjstoreError>;

  async fn exists(&self, key: &str) -> Result<bool, ObjstoreError>;

  async fn get(&self, key: &str) -> Result<Bytes, ObjstoreError>;

  // Invoke the callback with every object key under the prefix, in lexical order.
  async fn iter(
    &self,
    prefix: &str,
    f: &mut (dyn FnMut(String) + Send),
  ) -> Result<(), ObjstoreError>;

  async fn delete(&self, key: &str) -> Result<(), ObjstoreError>;
}

//
// InMemBucket
//

// In-memory implementation for tests.
#[derive(Default)]
pub struct InMemBucket {
  objects: Mutex<BTreeMap<String, Bytes>>,
}

impl InMemBucket {
  #[must_use]
  pub fn keys(&self) -> Vec<String> {
    self.objects.lock().keys().cloned().collect()
  }
}

#[async_trait]
impl Bucket for InMemBucket {
  fn name(&self) -> &'static str {
    "inmem"
  }

  async fn upload(&self, key: &str, data: Bytes) -> Result<(), ObjstoreError> {
    self.objects.lock().insert(key.to_string(), data);
    Ok(())
  }

  async fn exists(&self, key: &str) -> Result<bool, ObjstoreError> {
    Ok(self.objects.lock().contains_key(key))
  }

  async fn get(&self, key: &str) -> Result<Bytes, ObjstoreError> {
    self
      .objects
      .lock()
      .get(key)
      .cloned()
      .ok_or_else(|| ObjstoreError::NotFound(key.to_string()))
  }

  async fn iter(
    &self,
    prefix: &str,
    f: &mut (dyn FnMut(String) + Send),
  ) -> Result<(), ObjstoreError> {
    for key in self.objects.lock().keys() {
      if key.starts_with(prefix) {
        f(key.clone());
      }
    }
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), ObjstoreError> {
    self
      .objects
      .lock()
      .remove(key)
      .map(|_| ())
      .ok_or_else(|| ObjstoreError::NotFound(key.to_string()))
  }
}

//
// FsBucket
//

// Directory-backed bucket, the "filesystem" provider. Object keys map to relative paths under
// the root.
pub struct FsBucket {
  root: PathBuf,
}

impl FsBucket {
  pub fn new(root: impl Into<PathBuf>) -> Result<Self, ObjstoreError> {
    let root = root.into();
    std::fs::create_dir_all(&root)?;
    Ok(Self { root })
  }

  fn object_path(&self, key: &str) -> PathBuf {
    self.root.join(key)
  }

  fn collect_keys(
    &self,
    dir: &Path,
    prefix: &str,
    keys: &mut Vec<String>,
  ) -> Result<(), ObjstoreError> {
    for entry in std::fs::read_dir(dir)? {
      let entry = entry?;
      let path = entry.path();
      if entry.file_type()?.is_dir() {
        self.collect_keys(&path, prefix, keys)?;
      } else {
        let key = path
          .strip_prefix(&self.root)
          .expect("path is under the bucket root")
          .to_string_lossy()
          .to_string();
        if key.starts_with(prefix) && !key.ends_with(".tmp") {
          keys.push(key);
        }
      }
    }
    Ok(())
  }
}

#[async_trait]
impl Bucket for FsBucket {
  fn name(&self) -> &'static str {
    "filesystem"
  }

  async fn upload(&self, key: &str, data: Bytes) -> Result<(), ObjstoreError> {
    let path = self.object_path(key);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    // Temp file + rename keeps partially written objects invisible.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
  }

  async fn exists(&self, key: &str) -> Result<bool, ObjstoreError> {
    Ok(tokio::fs::try_exists(self.object_path(key)).await?)
  }

  async fn get(&self, key: &str) -> Result<Bytes, ObjstoreError> {
    match tokio::fs::read(self.object_path(key)).await {
      Ok(data) => Ok(data.into()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(ObjstoreError::NotFound(key.to_string()))
      },
      Err(e) => Err(e.into()),
    }
  }

  async fn iter(
    &self,
    prefix: &str,
    f: &mut (dyn FnMut(String) + Send),
  ) -> Result<(), ObjstoreError> {
    let mut keys = Vec::new();
    let root = self.root.clone();
    self.collect_keys(&root, prefix, &mut keys)?;
    keys.sort();
    for key in keys {
      f(key);
    }
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), ObjstoreError> {
    match tokio::fs::remove_file(self.object_path(key)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(ObjstoreError::NotFound(key.to_string()))
      },
      Err(e) => Err(e.into()),
    }
  }
}
