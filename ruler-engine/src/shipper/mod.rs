// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

use crate::labels::Labels;
use crate::objstore::Bucket;
use crate::tsdb::{BlockMeta, ThanosMeta};
use anyhow::Context;
use prometheus::IntCounter;
use ruler_common::stats::Scope;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ulid::Ulid;

pub const SHIPPER_META_FILENAME: &str = "thanos.shipper.json";
pub const RULER_SOURCE: &str = "RULER";

// Local index of block ULIDs already uploaded. Append-only: ULIDs are immutable, and
// re-uploading after a crash is acceptable since bucket writes are idempotent by key.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShipperMeta {
  pub version: u32,
  pub uploaded: Vec<String>,
}

impl ShipperMeta {
  pub fn read_from(dir: &Path) -> anyhow::Result<Self> {
    let path = dir.join(SHIPPER_META_FILENAME);
    if !path.exists() {
      return Ok(Self {
        version: 1,
        uploaded: Vec::new(),
      });
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
  }

  pub fn write_to(&self, dir: &Path) -> anyhow::Result<()> {
    let tmp = dir.join(format!("{SHIPPER_META_FILENAME}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
    std::fs::rename(&tmp, dir.join(SHIPPER_META_FILENAME))?;
    Ok(())
  }
}

struct Stats {
  dir_syncs_total: IntCounter,
  dir_sync_failures_total: IntCounter,
  uploads_total: IntCounter,
  upload_failures_total: IntCounter,
}

//
// Shipper
//

// Scans the data directory for sealed blocks not yet recorded in the shipped index and uploads
// them to the bucket under their ULID. Failed blocks are retried on the next sync; they never
// block the rule pipeline.
pub struct Shipper {
  data_dir: PathBuf,
  bucket: Arc<dyn Bucket>,
  external_labels: Labels,
  stats: Stats,
}

impl Shipper {
  pub fn new(
    scope: &Scope,
    data_dir: impl Into<PathBuf>,
    bucket: Arc<dyn Bucket>,
    external_labels: Labels,
  ) -> Self {
    let scope = scope.scope("shipper");
    Self {
      data_dir: data_dir.into(),
      bucket,
      external_labels,
      stats: Stats {
        dir_syncs_total: scope.counter("dir_syncs_total"),
        dir_sync_failures_total: scope.counter("dir_sync_failures_total"),
        uploads_total: scope.counter("uploads_total"),
        upload_failures_total: scope.counter("upload_failures_total"),
      },
    }
  }

  // One sync pass. Returns the number of blocks uploaded.
  pub async fn sync(&self) -> anyhow::Result<usize> {
    self.stats.dir_syncs_total.inc();
    let mut meta = ShipperMeta::read_from(&self.data_dir).inspect_err(|_| {
      self.stats.dir_sync_failures_total.inc();
    })?;

    let mut uploaded = 0;
    for block_dir in self.sealed_block_dirs()? {
      let ulid = block_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
      if meta.uploaded.iter().any(|u| *u == ulid) {
        continue;
      }

      match self.upload_block(&block_dir, &ulid).await {
        Ok(()) => {
          self.stats.uploads_total.inc();
          meta.uploaded.push(ulid);
          meta.write_to(&self.data_dir)?;
          uploaded += 1;
        },
        Err(e) => {
          // Partial uploads are retried next tick; bucket writes are idempotent by key.
          self.stats.upload_failures_total.inc();
          log::warn!("failed to upload block {ulid}: {e}");
        },
      }
    }
    Ok(uploaded)
  }

  fn sealed_block_dirs(&self) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(&self.data_dir).context("read data directory")? {
      let entry = entry?;
      if !entry.file_type()?.is_dir() {
        continue;
      }
      let name = entry.file_name().to_string_lossy().to_string();
      if Ulid::from_string(&name).is_ok() {
        dirs.push(entry.path());
      }
    }
    dirs.sort();
    Ok(dirs)
  }

  async fn upload_block(&self, block_dir: &Path, ulid: &str) -> anyhow::Result<()> {
    // Stamp the origin into the block before it leaves the node.
    let mut block_meta = BlockMeta::read_from(block_dir).context("read block meta")?;
    block_meta.thanos = Some(ThanosMeta {
      labels: self
        .external_labels
        .iter()
        .map(|l| (l.name.clone(), l.value.clone()))
        .collect(),
      source: RULER_SOURCE.to_string(),
    });
    block_meta.write_to(block_dir)?;

    for entry in std::fs::read_dir(block_dir)? {
      let entry = entry?;
      if !entry.file_type()?.is_file() {
        continue;
      }
      let file_name = entry.file_name().to_string_lossy().to_string();
      if file_name.ends_with(".tmp") {
        continue;
      }
      let data = tokio::fs::read(entry.path()).await?;
      self
        .bucket
        .upload(&format!("{ulid}/{file_name}"), data.into())
        .await
        .with_context(|| format!("upload {ulid}/{file_name}"))?;
    }
    log::info!("uploaded block {ulid} to bucket {}", self.bucket.name());
    Ok(())
  }
}
