// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::labels::Labels;
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::Duration;
use time::OffsetDateTime;
use ulid::Ulid;

pub const DEFAULT_BLOCK_DURATION: Duration = Duration::hours(2);
pub const DEFAULT_RETENTION: Duration = Duration::hours(48);

const META_FILENAME: &str = "meta.json";
const SERIES_FILENAME: &str = "series.json";
const WAL_DIR: &str = "wal";
const HEAD_CHECKPOINT_FILENAME: &str = "head.json";

#[must_use]
pub fn timestamp_ms(at: OffsetDateTime) -> i64 {
  i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

//
// BlockMeta
//

// Metadata file carried by every sealed block. The thanos section is stamped by the shipper
// right before upload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
  pub ulid: String,
  #[serde(rename = "minTime")]
  pub min_time: i64,
  #[serde(rename = "maxTime")]
  pub max_time: i64,
  pub version: u32,
  pub stats: BlockStats,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub thanos: Option<ThanosMeta>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
  #[serde(rename = "numSeries")]
  pub num_series: u64,
  #[serde(rename = "numSamples")]
  pub num_samples: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ThanosMeta {
  pub labels: BTreeMap<String, String>,
  pub source: String,
}

impl BlockMeta {
  pub fn read_from(block_dir: &Path) -> anyhow::Result<Self> {
    let contents = std::fs::read_to_string(block_dir.join(META_FILENAME))?;
    Ok(serde_json::from_str(&contents)?)
  }

  pub fn write_to(&self, block_dir: &Path) -> anyhow::Result<()> {
    // Temp file + rename so a crashed write never leaves a torn meta file.
    let tmp = block_dir.join(format!("{META_FILENAME}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
    std::fs::rename(&tmp, block_dir.join(META_FILENAME))?;
    Ok(())
  }
}

// Series payload of a sealed block.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockSeries {
  pub series: Vec<SeriesEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesEntry {
  pub labels: Labels,
  // (timestamp ms, value) pairs in timestamp order.
  pub samples: Vec<(i64, f64)>,
}

//
// Options
//

#[derive(Clone, Debug)]
pub struct Options {
  // Fixed block cadence: min and max block duration are equal so the embedded storage never
  // compacts beyond the initial cut.
  pub block_duration: Duration,
  pub retention: Duration,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      block_duration: DEFAULT_BLOCK_DURATION,
      retention: DEFAULT_RETENTION,
    }
  }
}

//
// Tsdb
//

#[derive(Default)]
struct Head {
  series: HashMap<Labels, Vec<(i64, f64)>>,
  min_time: Option<i64>,
  max_time: Option<i64>,
}

impl Head {
  fn append(&mut self, labels: Labels, timestamp_ms: i64, value: f64) {
    self.min_time = Some(self.min_time.map_or(timestamp_ms, |t| t.min(timestamp_ms)));
    self.max_time = Some(self.max_time.map_or(timestamp_ms, |t| t.max(timestamp_ms)));
    self.series.entry(labels).or_default().push((timestamp_ms, value));
  }
}

// Minimal embedded sample store behind the append/read contract the rule pipeline needs: an
// in-memory head, per-evaluation atomic appenders, fixed-cadence block cuts, and retention
// enforcement over the resulting immutable ULID-named block directories.
pub struct Tsdb {
  data_dir: PathBuf,
  opts: Options,
  head: Mutex<Head>,
}

impl Tsdb {
  pub fn open(data_dir: impl Into<PathBuf>, opts: Options) -> anyhow::Result<Arc<Self>> {
    let data_dir = data_dir.into();
    std::fs::create_dir_all(data_dir.join(WAL_DIR)).context("create data directory")?;

    let tsdb = Self {
      data_dir,
      opts,
      head: Mutex::new(Head::default()),
    };

    // Recover the head checkpoint from the previous clean shutdown, if any.
    let checkpoint = tsdb.data_dir.join(WAL_DIR).join(HEAD_CHECKPOINT_FILENAME);
    if checkpoint.exists() {
      let contents = std::fs::read_to_string(&checkpoint)?;
      let recovered: BlockSeries = serde_json::from_str(&contents)?;
      let mut head = tsdb.head.lock();
      for entry in recovered.series {
        for (timestamp_ms, value) in entry.samples {
          head.append(entry.labels.clone(), timestamp_ms, value);
        }
      }
      drop(head);
      std::fs::remove_file(&checkpoint)?;
    }

    Ok(Arc::new(tsdb))
  }

  #[must_use]
  pub fn data_dir(&self) -> &Path {
    &self.data_dir
  }

  #[must_use]
  pub fn appender(self: &Arc<Self>) -> Appender {
    Appender {
      tsdb: self.clone(),
      pending: Vec::new(),
    }
  }

  // Inclusive head time range, in ms. (0, 0) while the head is empty.
  #[must_use]
  pub fn head_time_range(&self) -> (i64, i64) {
    let head = self.head.lock();
    (head.min_time.unwrap_or(0), head.max_time.unwrap_or(0))
  }

  // Snapshot-consistent copy of the head series overlapping [min_time, max_time].
  #[must_use]
  pub fn head_series(&self, min_time: i64, max_time: i64) -> Vec<SeriesEntry> {
    let head = self.head.lock();
    let mut out: Vec<SeriesEntry> = head
      .series
      .iter()
      .filter_map(|(labels, samples)| {
        let samples: Vec<(i64, f64)> = samples
          .iter()
          .filter(|(t, _)| *t >= min_time && *t <= max_time)
          .copied()
          .collect();
        if samples.is_empty() {
          None
        } else {
          Some(SeriesEntry {
            labels: labels.clone(),
            samples,
          })
        }
      })
      .collect();
    out.sort_by(|a, b| a.labels.cmp(&b.labels));
    out
  }

  // All series overlapping the range, from sealed blocks and the head.
  pub fn series(&self, min_time: i64, max_time: i64) -> anyhow::Result<Vec<SeriesEntry>> {
    let mut merged: BTreeMap<Labels, Vec<(i64, f64)>> = BTreeMap::new();
    for meta in self.blocks()? {
      if meta.max_time < min_time || meta.min_time > max_time {
        continue;
      }
      let block_dir = self.data_dir.join(&meta.ulid);
      let contents = std::fs::read_to_string(block_dir.join(SERIES_FILENAME))?;
      let block: BlockSeries = serde_json::from_str(&contents)?;
      for entry in block.series {
        let samples = entry
          .samples
          .into_iter()
          .filter(|(t, _)| *t >= min_time && *t <= max_time);
        merged.entry(entry.labels).or_default().extend(samples);
      }
    }
    for entry in self.head_series(min_time, max_time) {
      merged.entry(entry.labels).or_default().extend(entry.samples);
    }

    Ok(
      merged
        .into_iter()
        .map(|(labels, mut samples)| {
          samples.sort_by_key(|(t, _)| *t);
          SeriesEntry { labels, samples }
        })
        .collect(),
    )
  }

  // Sealed block metas in the data directory, oldest first.
  pub fn blocks(&self) -> anyhow::Result<Vec<BlockMeta>> {
    let mut metas = Vec::new();
    for entry in std::fs::read_dir(&self.data_dir)? {
      let entry = entry?;
      if !entry.file_type()?.is_dir() {
        continue;
      }
      let name = entry.file_name().to_string_lossy().to_string();
      if Ulid::from_string(&name).is_err() {
        continue;
      }
      match BlockMeta::read_from(&entry.path()) {
        Ok(meta) => metas.push(meta),
        Err(e) => log::warn!("skipping block {name} with unreadable meta: {e}"),
      }
    }
    metas.sort_by_key(|m| m.min_time);
    Ok(metas)
  }

  // Cut every filled block window older than the currently open one into an immutable block
  // directory. Returns the ULIDs of the new blocks.
  pub fn compact(&self, now: OffsetDateTime) -> anyhow::Result<Vec<Ulid>> {
    let block_ms = self.opts.block_duration.whole_milliseconds() as i64;
    let open_window_start = (timestamp_ms(now) / block_ms) * block_ms;

    // Partition head samples into per-window groups below the open window.
    let mut windows: BTreeMap<i64, BTreeMap<Labels, Vec<(i64, f64)>>> = BTreeMap::new();
    {
      let mut head = self.head.lock();
      for (labels, samples) in &mut head.series {
        samples.retain(|(t, v)| {
          if *t >= open_window_start {
            return true;
          }
          windows
            .entry((*t / block_ms) * block_ms)
            .or_default()
            .entry(labels.clone())
            .or_default()
            .push((*t, *v));
          false
        });
      }
      head.series.retain(|_, samples| !samples.is_empty());
      head.min_time = head.series.values().flatten().map(|(t, _)| *t).min();
      head.max_time = head.series.values().flatten().map(|(t, _)| *t).max();
    }

    let mut cut = Vec::new();
    for (window_start, series) in windows {
      let ulid = Ulid::new();
      let num_samples: u64 = series.values().map(|s| s.len() as u64).sum();
      let entries: Vec<SeriesEntry> = series
        .into_iter()
        .map(|(labels, mut samples)| {
          samples.sort_by_key(|(t, _)| *t);
          SeriesEntry { labels, samples }
        })
        .collect();

      let meta = BlockMeta {
        ulid: ulid.to_string(),
        min_time: window_start,
        max_time: window_start + block_ms,
        version: 1,
        stats: BlockStats {
          num_series: entries.len() as u64,
          num_samples,
        },
        thanos: None,
      };

      // Build in a temp directory and rename into place so a block is either absent or sealed.
      let block_dir = self.data_dir.join(ulid.to_string());
      let tmp_dir = self.data_dir.join(format!("{ulid}.tmp"));
      std::fs::create_dir_all(&tmp_dir)?;
      std::fs::write(
        tmp_dir.join(SERIES_FILENAME),
        serde_json::to_vec(&BlockSeries { series: entries })?,
      )?;
      meta.write_to(&tmp_dir)?;
      std::fs::rename(&tmp_dir, &block_dir)?;
      log::info!(
        "cut block {ulid} [{}, {}) with {num_samples} sample(s)",
        meta.min_time,
        meta.max_time
      );
      cut.push(ulid);
    }
    Ok(cut)
  }

  // Delete blocks entirely past the retention horizon. Returns the number deleted.
  pub fn truncate(&self, now: OffsetDateTime) -> anyhow::Result<usize> {
    let horizon = timestamp_ms(now) - self.opts.retention.whole_milliseconds() as i64;
    let mut deleted = 0;
    for meta in self.blocks()? {
      if meta.max_time <= horizon {
        std::fs::remove_dir_all(self.data_dir.join(&meta.ulid))?;
        log::info!("deleted block {} past retention", meta.ulid);
        deleted += 1;
      }
    }
    Ok(deleted)
  }

  // Persist the open head so a clean restart does not lose it. Called on shutdown.
  pub fn close(&self) -> anyhow::Result<()> {
    let entries: Vec<SeriesEntry> = {
      let head = self.head.lock();
      head
        .series
        .iter()
        .map(|(labels, samples)| SeriesEntry {
          labels: labels.clone(),
          samples: samples.clone(),
        })
        .collect()
    };
    if entries.is_empty() {
      return Ok(());
    }
    let checkpoint = self.data_dir.join(WAL_DIR).join(HEAD_CHECKPOINT_FILENAME);
    let tmp = self.data_dir.join(WAL_DIR).join(format!("{HEAD_CHECKPOINT_FILENAME}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec(&BlockSeries { series: entries })?)?;
    std::fs::rename(&tmp, checkpoint)?;
    Ok(())
  }
}

//
// Appender
//

// Buffers one rule evaluation's samples; commit makes them visible atomically, drop discards.
pub struct Appender {
  tsdb: Arc<Tsdb>,
  pending: Vec<(Labels, i64, f64)>,
}

impl Appender {
  pub fn append(&mut self, labels: Labels, timestamp_ms: i64, value: f64) {
    self.pending.push((labels, timestamp_ms, value));
  }

  pub fn commit(self) {
    let mut head = self.tsdb.head.lock();
    for (labels, timestamp_ms, value) in self.pending {
      head.append(labels, timestamp_ms, value);
    }
  }

  pub fn rollback(self) {}
}
