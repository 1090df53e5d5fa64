// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./dns_test.rs"]
mod dns_test;

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use parking_lot::RwLock;
use prometheus::{IntCounter, IntGauge};
use ruler_common::stats::Scope;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("unknown DNS lookup scheme {0:?}")]
  UnknownScheme(String),
  #[error("missing port in address {0:?} and no default port configured")]
  MissingPort(String),
  #[error("lookup failed for {name}: {message}")]
  Lookup { name: String, message: String },
}

// The lookup kind encoded in an address prefix: "dns+" resolves A/AAAA records, "dnssrv+"
// resolves SRV records, no prefix passes the address through untouched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QType {
  None,
  A,
  Srv,
}

// Split an address on the first '+'. Addresses without a '+' are passthrough.
pub fn parse_prefixed_addr(addr: &str) -> Result<(QType, &str), ResolveError> {
  match addr.split_once('+') {
    None => Ok((QType::None, addr)),
    Some(("dns", rest)) => Ok((QType::A, rest)),
    Some(("dnssrv", rest)) => Ok((QType::Srv, rest)),
    Some((scheme, _)) => Err(ResolveError::UnknownScheme(scheme.to_string())),
  }
}

// Split host:port, tolerating bracketed IPv6 literals.
#[must_use]
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
  let (host, port) = addr.rsplit_once(':')?;
  if host.is_empty() || port.contains(']') {
    return None;
  }
  let port = port.parse().ok()?;
  Some((host.trim_start_matches('[').trim_end_matches(']'), port))
}

//
// Resolver
//

// One level below the provider: a single record lookup. Mocked in tests so that discovery logic
// is exercised without real DNS.
#[mockall::automock]
#[async_trait]
pub trait Resolver: Send + Sync {
  // Resolve A/AAAA records for a host; every record keeps the supplied port.
  async fn resolve_a(&self, host: &str, port: u16) -> anyhow::Result<Vec<String>>;

  // Resolve SRV records for a service name; records carry their own ports.
  async fn resolve_srv(&self, service: &str) -> anyhow::Result<Vec<String>>;
}

pub struct HickoryResolver {
  inner: TokioResolver,
}

impl HickoryResolver {
  pub fn new() -> anyhow::Result<Self> {
    Ok(Self {
      inner: TokioResolver::builder_tokio()?.build(),
    })
  }
}

#[async_trait]
impl Resolver for HickoryResolver {
  async fn resolve_a(&self, host: &str, port: u16) -> anyhow::Result<Vec<String>> {
    Ok(
      self
        .inner
        .lookup_ip(host)
        .await?
        .iter()
        .map(|ip| format!("{ip}:{port}"))
        .collect(),
    )
  }

  async fn resolve_srv(&self, service: &str) -> anyhow::Result<Vec<String>> {
    Ok(
      self
        .inner
        .srv_lookup(service)
        .await?
        .iter()
        .map(|srv| {
          let target = srv.target().to_string();
          format!("{}:{}", target.trim_end_matches('.'), srv.port())
        })
        .collect(),
    )
  }
}

//
// Provider
//

struct Stats {
  resolution_errors: IntCounter,
  resolved_addresses: IntGauge,
}

// Expands a set of possibly dns+/dnssrv+ prefixed addresses into concrete host:port strings.
// The view is replaced wholesale at the end of each resolution round so readers never observe a
// partially resolved set.
pub struct Provider {
  resolver: Arc<dyn Resolver>,
  default_port: Option<u16>,
  current: RwLock<Arc<Vec<String>>>,
  stats: Stats,
}

impl Provider {
  pub fn new(scope: &Scope, resolver: Arc<dyn Resolver>, default_port: Option<u16>) -> Self {
    Self {
      resolver,
      default_port,
      current: RwLock::new(Arc::new(Vec::new())),
      stats: Stats {
        resolution_errors: scope.counter("resolution_errors_total"),
        resolved_addresses: scope.gauge("resolved_addresses"),
      },
    }
  }

  // Re-resolve every address. A failing entry is logged and counted but does not keep the other
  // entries out of the new snapshot.
  pub async fn resolve(&self, addrs: &[String]) {
    let mut resolved = BTreeSet::new();
    for addr in addrs {
      match self.resolve_one(addr).await {
        Ok(entries) => resolved.extend(entries),
        Err(e) => {
          log::warn!("failed to resolve {addr}: {e}");
          self.stats.resolution_errors.inc();
        },
      }
    }

    let resolved: Vec<String> = resolved.into_iter().collect();
    self
      .stats
      .resolved_addresses
      .set(resolved.len().try_into().unwrap_or(i64::MAX));
    *self.current.write() = Arc::new(resolved);
  }

  async fn resolve_one(&self, addr: &str) -> Result<Vec<String>, ResolveError> {
    let (qtype, name) = parse_prefixed_addr(addr)?;
    match qtype {
      QType::None => Ok(vec![name.to_string()]),
      QType::A => {
        let (host, port) = match split_host_port(name) {
          Some((host, port)) => (host, port),
          None => (
            name,
            self
              .default_port
              .ok_or_else(|| ResolveError::MissingPort(addr.to_string()))?,
          ),
        };
        self
          .resolver
          .resolve_a(host, port)
          .await
          .map_err(|e| ResolveError::Lookup {
            name: name.to_string(),
            message: e.to_string(),
          })
      },
      QType::Srv => {
        self
          .resolver
          .resolve_srv(name)
          .await
          .map_err(|e| ResolveError::Lookup {
            name: name.to_string(),
            message: e.to_string(),
          })
      },
    }
  }

  // The most recent complete snapshot. Never blocks on an in-flight resolution round.
  #[must_use]
  pub fn addresses(&self) -> Arc<Vec<String>> {
    self.current.read().clone()
  }
}
