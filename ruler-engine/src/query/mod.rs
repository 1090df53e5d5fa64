// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

pub mod client;

use self::client::{QueryClient, Vector};
use crate::discovery::dns::Provider;
use crate::discovery::file_sd::Cache;
use prometheus::{IntCounter, IntCounterVec};
use rand::seq::SliceRandom;
use ruler_common::stats::Scope;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum QueryError {
  #[error("no query peer reachable")]
  NoQueryPeer,
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("bad response status: {0}")]
  Status(http::StatusCode),
  #[error("malformed query response: {0}")]
  Malformed(String),
}

// How a query server should treat stores it cannot reach during an evaluation: fail the query,
// or answer with what it has and carry a warning.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialResponseStrategy {
  #[default]
  #[serde(alias = "ABORT")]
  Abort,
  #[serde(alias = "WARN")]
  Warn,
}

impl PartialResponseStrategy {
  #[must_use]
  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::Abort => "ABORT",
      Self::Warn => "WARN",
    }
  }

  // Lower-case form used as a metric label value.
  #[must_use]
  pub const fn as_label(&self) -> &'static str {
    match self {
      Self::Abort => "abort",
      Self::Warn => "warn",
    }
  }
}

//
// QueryStats
//

// Shared between the per-strategy query functions so both report into the same series.
#[derive(Clone)]
pub struct QueryStats {
  duplicated_query_address: IntCounter,
  evaluation_with_warnings: IntCounterVec,
}

impl QueryStats {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    let scope = scope.scope("rule");
    Self {
      duplicated_query_address: scope.counter("duplicated_query_address"),
      evaluation_with_warnings: scope.counter_vec("evaluation_with_warnings_total", &["strategy"]),
    }
  }
}

//
// QueryFunc
//

// Turns one PromQL evaluation into instant-query attempts across the discovered query servers,
// in uniformly random order, until one succeeds. Randomization is the only load-spreading
// mechanism; there is no sticky affinity.
pub struct QueryFunc {
  client: Arc<dyn QueryClient>,
  dns_provider: Arc<Provider>,
  file_sd_cache: Arc<Cache>,
  strategy: PartialResponseStrategy,
  stats: QueryStats,
}

impl QueryFunc {
  pub fn new(
    client: Arc<dyn QueryClient>,
    dns_provider: Arc<Provider>,
    file_sd_cache: Arc<Cache>,
    strategy: PartialResponseStrategy,
    stats: QueryStats,
  ) -> Self {
    Self {
      client,
      dns_provider,
      file_sd_cache,
      strategy,
      stats,
    }
  }

  fn snapshot_addresses(&self) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut addrs = Vec::new();
    for addr in self
      .dns_provider
      .addresses()
      .iter()
      .chain(self.file_sd_cache.addresses().iter())
    {
      if seen.insert(addr.clone()) {
        addrs.push(addr.clone());
      } else {
        self.stats.duplicated_query_address.inc();
        log::debug!("duplicate query address {addr}");
      }
    }
    addrs
  }

  pub async fn eval(&self, query: &str, at: OffsetDateTime) -> Result<Vector, QueryError> {
    let mut addrs = self.snapshot_addresses();
    if addrs.is_empty() {
      return Err(QueryError::NoQueryPeer);
    }
    addrs.shuffle(&mut rand::thread_rng());

    for addr in &addrs {
      match self.client.query_instant(addr, query, at, self.strategy).await {
        Ok(result) => {
          if !result.warnings.is_empty() {
            self
              .stats
              .evaluation_with_warnings
              .with_label_values(&[self.strategy.as_label()])
              .inc();
            log::warn!(
              "partial response for query {query:?}: {}",
              result.warnings.join(", ")
            );
          }
          return Ok(result.vector);
        },
        Err(e) => {
          log::warn!("query against {addr} failed: {e}");
        },
      }
    }
    Err(QueryError::NoQueryPeer)
  }
}
