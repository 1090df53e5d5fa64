// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::{Context, bail};
use clap::Parser;
use ruler_engine::rules::parse_duration;
use std::collections::HashSet;
use time::Duration;
use url::Url;

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
  parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(
  name = "ruler",
  about = "Evaluates Prometheus rules against query nodes, exposes a Store API, and ships \
           finished blocks to object storage."
)]
pub struct Options {
  /// Labels applied to all generated metrics and alerts, identifying this node as a unique
  /// source (repeated, name="value").
  #[arg(long = "label")]
  pub labels: Vec<String>,

  #[arg(long = "data-dir", default_value = "data/")]
  pub data_dir: String,

  /// Rule files to evaluate. Can be in glob format (repeated).
  #[arg(long = "rule-file", default_value = "rules/")]
  pub rule_files: Vec<String>,

  /// The default evaluation interval for groups that do not declare one.
  #[arg(long = "eval-interval", default_value = "30s", value_parser = parse_duration_arg)]
  pub eval_interval: Duration,

  #[arg(long = "tsdb.block-duration", default_value = "2h", value_parser = parse_duration_arg)]
  pub tsdb_block_duration: Duration,

  #[arg(long = "tsdb.retention", default_value = "48h", value_parser = parse_duration_arg)]
  pub tsdb_retention: Duration,

  /// Alertmanager replica URLs to push firing alerts to. A push succeeds if at least one
  /// replica accepts it. The scheme may be prefixed with 'dns+' or 'dnssrv+' to discover
  /// replicas through DNS (repeated).
  #[arg(long = "alertmanagers.url")]
  pub alertmanagers_url: Vec<String>,

  #[arg(
    long = "alertmanagers.send-timeout",
    default_value = "10s",
    value_parser = parse_duration_arg
  )]
  pub alertmanagers_send_timeout: Duration,

  /// External query URL set in the 'Source' field of all alerts. Derived from the OS hostname
  /// and the HTTP listen port when unset.
  #[arg(long = "alert.query-url")]
  pub alert_query_url: Option<String>,

  /// Labels dropped from alerts before sending, so HA replica alerts deduplicate downstream
  /// (repeated).
  #[arg(long = "alert.label-drop")]
  pub alert_label_drop: Vec<String>,

  /// Prefix for the reload endpoint, for serving behind a reverse proxy sub-path.
  #[arg(long = "web.route-prefix", default_value = "")]
  pub web_route_prefix: String,

  /// Addresses of statically configured query API servers. The scheme may be prefixed with
  /// 'dns+' or 'dnssrv+' to discover servers through DNS (repeated).
  #[arg(long = "query")]
  pub queries: Vec<String>,

  /// Paths to files that contain addresses of query peers, in target-group format. Can be in
  /// glob format (repeated).
  #[arg(long = "query.sd-files")]
  pub query_sd_files: Vec<String>,

  /// Refresh interval to re-read file SD files.
  #[arg(long = "query.sd-interval", default_value = "5m", value_parser = parse_duration_arg)]
  pub query_sd_interval: Duration,

  /// Interval between DNS resolutions of query servers.
  #[arg(long = "query.sd-dns-interval", default_value = "30s", value_parser = parse_duration_arg)]
  pub query_sd_dns_interval: Duration,

  /// Root directory of the filesystem object-storage bucket. Uploads are disabled when unset.
  #[arg(long = "objstore.path")]
  pub objstore_path: Option<String>,

  #[arg(long = "grpc-address", default_value = "0.0.0.0:10901")]
  pub grpc_address: String,

  #[arg(long = "http-address", default_value = "0.0.0.0:10902")]
  pub http_address: String,
}

impl Options {
  pub fn validate(&self) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for query in &self.queries {
      if query.is_empty() {
        bail!("static querier address cannot be empty");
      }
      if !seen.insert(query.as_str()) {
        bail!("address {query} is duplicated for --query flag");
      }
    }
    if self.queries.is_empty() && self.query_sd_files.is_empty() {
      bail!("no --query parameter was given");
    }
    if !self.web_route_prefix.is_empty() && !self.web_route_prefix.starts_with('/') {
      bail!("--web.route-prefix must start with '/'");
    }
    if self.eval_interval <= Duration::ZERO {
      bail!("--eval-interval must be positive");
    }
    Ok(())
  }

  // The URL stamped into every alert's generator field. Fabricated from the OS hostname and
  // the HTTP listen port when the operator did not supply one; a missing hostname is a startup
  // error.
  pub fn resolve_alert_query_url(&self) -> anyhow::Result<Url> {
    if let Some(url) = &self.alert_query_url {
      return Url::parse(url).with_context(|| format!("parse alert query url {url:?}"));
    }

    let hostname = hostname::get()
      .context("determine hostname for alert query URL")?
      .to_string_lossy()
      .to_string();
    if hostname.is_empty() {
      bail!("cannot detect a hostname and no --alert.query-url given");
    }
    let (_, port) = self
      .http_address
      .rsplit_once(':')
      .context("no port in --http-address")?;
    Ok(Url::parse(&format!("http://{hostname}:{port}"))?)
  }
}

// The table link for an expression on the query frontend, used as the alert generator URL.
#[must_use]
pub fn generator_url(query_url: &Url, expr: &str) -> String {
  let encoded: String = url::form_urlencoded::byte_serialize(expr.as_bytes()).collect();
  format!(
    "{}/graph?g0.expr={encoded}&g0.tab=1",
    query_url.as_str().trim_end_matches('/')
  )
}
