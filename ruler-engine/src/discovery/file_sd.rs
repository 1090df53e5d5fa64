// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./file_sd_test.rs"]
mod file_sd_test;

use async_trait::async_trait;
use parking_lot::Mutex;
use ruler_common::shutdown::ComponentShutdown;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub const ADDRESS_LABEL: &str = "__address__";

// One target group from a Prometheus file-SD file: a list of host:port targets plus shared
// labels. Only the targets matter to the ruler; labels are carried for format fidelity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
  pub targets: Vec<String>,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
}

//
// Cache
//

// Flattens target-group updates into a plain address set, replaced atomically per update.
#[derive(Default)]
pub struct Cache {
  current: Mutex<Arc<Vec<String>>>,
}

impl Cache {
  pub fn update(&self, groups: &[TargetGroup]) {
    let addresses: BTreeSet<&str> = groups
      .iter()
      .flat_map(|g| g.targets.iter().map(String::as_str))
      .collect();
    let addresses: Vec<String> = addresses.into_iter().map(str::to_string).collect();
    *self.current.lock() = Arc::new(addresses);
  }

  #[must_use]
  pub fn addresses(&self) -> Arc<Vec<String>> {
    self.current.lock().clone()
  }
}

//
// Ticker
//

#[async_trait]
pub trait Ticker: Send + Sync {
  async fn next(&mut self);
}

// An interval rather than a sleep so a slow read does not skew the cadence.
#[async_trait]
impl Ticker for tokio::time::Interval {
  async fn next(&mut self) {
    self.tick().await;
  }
}

fn read_groups(patterns: &[String]) -> Vec<TargetGroup> {
  let mut groups = Vec::new();
  for pattern in patterns {
    let paths = match glob::glob(pattern) {
      Ok(paths) => paths,
      Err(e) => {
        log::warn!("bad file SD pattern {pattern:?}: {e}");
        continue;
      },
    };
    for path in paths.flatten() {
      match read_file(&path) {
        Ok(file_groups) => groups.extend(file_groups),
        Err(e) => log::warn!("failed to read file SD file {}: {e}", path.display()),
      }
    }
  }
  groups
}

fn read_file(path: &Path) -> anyhow::Result<Vec<TargetGroup>> {
  let contents = std::fs::read_to_string(path)?;
  // serde_yaml parses both the YAML and JSON renditions of the format.
  Ok(serde_yaml::from_str(&contents)?)
}

// Spawn the file SD fetcher. Re-reads all files matching the patterns on every tick and
// publishes the parsed groups whenever they change. The initial read happens before returning so
// callers start with a populated receiver.
pub fn make_fetcher(
  patterns: Vec<String>,
  mut ticker: Box<dyn Ticker>,
  shutdown: ComponentShutdown,
) -> watch::Receiver<Vec<TargetGroup>> {
  let (tx, rx) = watch::channel(read_groups(&patterns));
  tokio::spawn(async move {
    loop {
      tokio::select! {
        () = ticker.next() => {
          let groups = read_groups(&patterns);
          tx.send_if_modified(|existing| {
            if groups == *existing {
              false
            } else {
              log::debug!("file SD update: {} group(s)", groups.len());
              *existing = groups;
              true
            }
          });
        },
        () = shutdown.cancelled() => break,
      }
    }
    log::debug!("file SD fetcher shutting down");
    drop(shutdown);
  });

  rx
}
