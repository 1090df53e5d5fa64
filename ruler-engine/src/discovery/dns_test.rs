// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use anyhow::anyhow;
use pretty_assertions::assert_eq;
use ruler_common::stats::Collector;

fn make_provider(resolver: MockResolver, default_port: Option<u16>) -> Provider {
  Provider::new(
    &Collector::default().scope("test"),
    Arc::new(resolver),
    default_port,
  )
}

#[test]
fn prefix_parsing() {
  assert_eq!(
    (QType::None, "host:9090"),
    parse_prefixed_addr("host:9090").unwrap()
  );
  assert_eq!(
    (QType::A, "host:9090"),
    parse_prefixed_addr("dns+host:9090").unwrap()
  );
  assert_eq!(
    (QType::Srv, "_web._tcp.host"),
    parse_prefixed_addr("dnssrv+_web._tcp.host").unwrap()
  );
  assert!(matches!(
    parse_prefixed_addr("dnssrvnoa+host"),
    Err(ResolveError::UnknownScheme(_))
  ));
}

#[test]
fn host_port_splitting() {
  assert_eq!(Some(("host", 9090)), split_host_port("host:9090"));
  assert_eq!(Some(("::1", 9090)), split_host_port("[::1]:9090"));
  assert_eq!(None, split_host_port("host"));
  assert_eq!(None, split_host_port("[::1]"));
}

#[tokio::test]
async fn passthrough_addresses_skip_resolution() {
  let provider = make_provider(MockResolver::new(), None);
  provider.resolve(&["a:9090".to_string(), "b:9090".to_string()]).await;
  assert_eq!(
    vec!["a:9090".to_string(), "b:9090".to_string()],
    *provider.addresses()
  );
}

#[tokio::test]
async fn a_records_keep_the_supplied_port() {
  let mut resolver = MockResolver::new();
  resolver
    .expect_resolve_a()
    .withf(|host, port| host == "query.example" && *port == 9090)
    .returning(|_, port| Ok(vec![format!("10.0.0.1:{port}"), format!("10.0.0.2:{port}")]));
  let provider = make_provider(resolver, None);

  provider.resolve(&["dns+query.example:9090".to_string()]).await;
  assert_eq!(
    vec!["10.0.0.1:9090".to_string(), "10.0.0.2:9090".to_string()],
    *provider.addresses()
  );
}

#[tokio::test]
async fn a_record_without_port_uses_default_or_fails() {
  let mut resolver = MockResolver::new();
  resolver
    .expect_resolve_a()
    .withf(|host, port| host == "am.example" && *port == 9093)
    .returning(|_, port| Ok(vec![format!("10.0.0.1:{port}")]));
  let provider = make_provider(resolver, Some(9093));
  provider.resolve(&["dns+am.example".to_string()]).await;
  assert_eq!(vec!["10.0.0.1:9093".to_string()], *provider.addresses());

  // Without a default port the entry fails and the snapshot becomes empty.
  let provider = make_provider(MockResolver::new(), None);
  provider.resolve(&["dns+query.example".to_string()]).await;
  assert!(provider.addresses().is_empty());
}

#[tokio::test]
async fn failing_entry_does_not_block_others() {
  let mut resolver = MockResolver::new();
  resolver
    .expect_resolve_a()
    .returning(|_, _| Err(anyhow!("NXDOMAIN")));
  let provider = make_provider(resolver, None);

  provider
    .resolve(&["dns+missing.example:9090".to_string(), "static:9090".to_string()])
    .await;
  assert_eq!(vec!["static:9090".to_string()], *provider.addresses());
}

#[tokio::test]
async fn snapshot_is_replaced_wholesale() {
  let mut resolver = MockResolver::new();
  resolver
    .expect_resolve_srv()
    .returning(|_| Ok(vec!["n1:1234".to_string()]));
  let provider = make_provider(resolver, None);

  provider.resolve(&["dnssrv+_q._tcp.example".to_string()]).await;
  let first = provider.addresses();
  assert_eq!(vec!["n1:1234".to_string()], *first);

  provider.resolve(&["other:9090".to_string()]).await;
  // The old snapshot handle is unaffected; the new view is complete.
  assert_eq!(vec!["n1:1234".to_string()], *first);
  assert_eq!(vec!["other:9090".to_string()], *provider.addresses());
}

#[tokio::test]
async fn duplicate_results_are_deduplicated() {
  let mut resolver = MockResolver::new();
  resolver
    .expect_resolve_a()
    .returning(|_, port| Ok(vec![format!("10.0.0.1:{port}")]));
  let provider = make_provider(resolver, None);

  provider
    .resolve(&[
      "dns+a.example:9090".to_string(),
      "dns+b.example:9090".to_string(),
      "10.0.0.1:9090".to_string(),
    ])
    .await;
  assert_eq!(vec!["10.0.0.1:9090".to_string()], *provider.addresses());
}
