// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./sender_test.rs"]
mod sender_test;

use super::Notification;
use crate::discovery::dns::{QType, Resolver, parse_prefixed_addr, split_host_port};
use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use prometheus::{Histogram, IntCounter};
use ruler_common::stats::Scope;
use std::sync::Arc;
use thiserror::Error;
use time::Duration;
use url::Url;

pub const DEFAULT_ALERTMANAGER_PORT: u16 = 9093;
const ALERT_PUSH_PATH: &str = "api/v1/alerts";

#[derive(Debug, Error)]
pub enum SendError {
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("bad response status: {0}")]
  Status(StatusCode),
}

//
// AlertmanagerSet
//

// Holds the configured Alertmanager URLs and periodically re-resolves any dns+/dnssrv+ prefixed
// entries into a concrete URL list. A failed round leaves the previous list in place.
pub struct AlertmanagerSet {
  addrs: Vec<String>,
  resolver: Arc<dyn Resolver>,
  current: Mutex<Arc<Vec<Url>>>,
}

impl AlertmanagerSet {
  pub fn new(addrs: Vec<String>, resolver: Arc<dyn Resolver>) -> Self {
    Self {
      addrs,
      resolver,
      current: Mutex::new(Arc::new(Vec::new())),
    }
  }

  pub async fn update(&self) -> anyhow::Result<()> {
    let mut result = Vec::new();
    for addr in &self.addrs {
      let (qtype, name) = parse_prefixed_addr(addr)?;
      let url = Url::parse(name)?;
      let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("no host in alertmanager URL {name:?}"))?;
      let host_port = url
        .port()
        .map_or_else(|| host.to_string(), |port| format!("{host}:{port}"));

      let resolved = match qtype {
        QType::None => {
          // Static URLs pass through untouched, ported or not.
          result.push(url);
          continue;
        },
        QType::A => {
          let (host, port) = split_host_port(&host_port)
            .unwrap_or((host_port.as_str(), DEFAULT_ALERTMANAGER_PORT));
          self.resolver.resolve_a(host, port).await?
        },
        QType::Srv => self.resolver.resolve_srv(&host_port).await?,
      };

      // Each record becomes a URL sharing the original scheme, userinfo, and path.
      for record in resolved {
        let mut resolved_url = url.clone();
        let (host, port) = split_host_port(&record)
          .ok_or_else(|| anyhow::anyhow!("resolved record {record:?} is not host:port"))?;
        resolved_url
          .set_host(Some(host))
          .map_err(|e| anyhow::anyhow!("cannot set host {host:?}: {e}"))?;
        resolved_url
          .set_port(Some(port))
          .map_err(|()| anyhow::anyhow!("cannot set port on {record:?}"))?;
        result.push(resolved_url);
      }
    }

    *self.current.lock() = Arc::new(result);
    Ok(())
  }

  // The current concrete URL list. Callers must treat the slice as immutable.
  #[must_use]
  pub fn get(&self) -> Arc<Vec<Url>> {
    self.current.lock().clone()
  }
}

//
// AlertmanagerClient
//

/// A thin client wrapper used for mocking in tests.
#[mockall::automock]
#[async_trait]
pub trait AlertmanagerClient: Send + Sync {
  async fn send(&self, url: &Url, alerts: &[Notification]) -> Result<(), SendError>;
}

pub struct ReqwestAlertmanagerClient {
  inner: reqwest::Client,
  timeout: Duration,
}

impl ReqwestAlertmanagerClient {
  #[must_use]
  pub fn new(timeout: Duration) -> Self {
    Self {
      inner: reqwest::Client::new(),
      timeout,
    }
  }
}

#[async_trait]
impl AlertmanagerClient for ReqwestAlertmanagerClient {
  async fn send(&self, url: &Url, alerts: &[Notification]) -> Result<(), SendError> {
    let mut push_url = url.clone();
    {
      let mut path = push_url.path().trim_end_matches('/').to_string();
      path.push('/');
      path.push_str(ALERT_PUSH_PATH);
      push_url.set_path(&path);
    }

    let response = self
      .inner
      .post(push_url)
      .timeout(self.timeout.unsigned_abs())
      .json(alerts)
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(SendError::Status(response.status()));
    }
    Ok(())
  }
}

//
// Sender
//

struct Stats {
  sent_total: IntCounter,
  dropped_total: IntCounter,
  errors_total: IntCounter,
  latency: Histogram,
}

// Fans one alert batch out to every replica in the current Alertmanager set. The batch counts as
// delivered when at least one replica accepts it; there are no retries since alerting rules
// re-fire on the next evaluation.
pub struct Sender {
  alertmanagers: Arc<AlertmanagerSet>,
  client: Arc<dyn AlertmanagerClient>,
  stats: Stats,
}

impl Sender {
  pub fn new(
    scope: &Scope,
    alertmanagers: Arc<AlertmanagerSet>,
    client: Arc<dyn AlertmanagerClient>,
  ) -> Self {
    let scope = scope.scope("alert_sender");
    Self {
      alertmanagers,
      client,
      stats: Stats {
        sent_total: scope.counter("alerts_sent_total"),
        dropped_total: scope.counter("alerts_dropped_total"),
        errors_total: scope.counter("errors_total"),
        latency: scope.histogram("latency_seconds"),
      },
    }
  }

  pub async fn send(&self, batch: &[Notification]) {
    if batch.is_empty() {
      return;
    }
    let batch_len: u64 = batch.len().try_into().unwrap_or(0);

    let urls = self.alertmanagers.get();
    if urls.is_empty() {
      self.stats.dropped_total.inc_by(batch_len);
      log::warn!("no alertmanager configured, dropped {batch_len} alert(s)");
      return;
    }

    let timer = self.stats.latency.start_timer();
    let results = futures::future::join_all(urls.iter().map(|url| async move {
      self
        .client
        .send(url, batch)
        .await
        .inspect_err(|e| {
          self.stats.errors_total.inc();
          log::warn!("failed to send alerts to {url}: {e}");
        })
        .is_ok()
    }))
    .await;
    drop(timer);

    if results.into_iter().any(|ok| ok) {
      self.stats.sent_total.inc_by(batch_len);
    } else {
      self.stats.dropped_total.inc_by(batch_len);
      log::warn!("no alertmanager accepted a batch of {batch_len} alert(s)");
    }
  }
}
