// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::client::{InstantQueryResult, MockQueryClient, Sample};
use super::*;
use crate::discovery::dns::MockResolver;
use crate::discovery::file_sd::TargetGroup;
use crate::labels::Labels;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use ruler_common::stats::Collector;
use std::collections::BTreeMap;
use std::collections::HashMap;

fn make_provider(scope: &Scope) -> Arc<Provider> {
  Arc::new(Provider::new(scope, Arc::new(MockResolver::new()), None))
}

async fn provider_with(scope: &Scope, addrs: &[&str]) -> Arc<Provider> {
  let provider = make_provider(scope);
  provider
    .resolve(&addrs.iter().map(|a| (*a).to_string()).collect::<Vec<_>>())
    .await;
  provider
}

fn make_func(
  client: MockQueryClient,
  provider: Arc<Provider>,
  cache: Arc<Cache>,
  strategy: PartialResponseStrategy,
  collector: &Collector,
) -> QueryFunc {
  let stats = QueryStats::new(&collector.scope("thanos"));
  QueryFunc::new(Arc::new(client), provider, cache, strategy, stats)
}

fn vector_result(value: f64) -> InstantQueryResult {
  InstantQueryResult {
    vector: vec![Sample {
      labels: Labels::from_pairs([("job", "x")]),
      value,
    }],
    warnings: Vec::new(),
  }
}

#[tokio::test]
async fn empty_address_list_makes_no_requests() {
  let collector = Collector::default();
  let mut client = MockQueryClient::new();
  client.expect_query_instant().times(0);

  let func = make_func(
    client,
    make_provider(&collector.scope("test")),
    Arc::new(Cache::default()),
    PartialResponseStrategy::Abort,
    &collector,
  );
  assert!(matches!(
    func.eval("up", time::OffsetDateTime::UNIX_EPOCH).await,
    Err(QueryError::NoQueryPeer)
  ));
}

#[tokio::test]
async fn failing_address_falls_through_to_next() {
  let collector = Collector::default();
  let attempts = Arc::new(Mutex::new(Vec::new()));

  let mut client = MockQueryClient::new();
  let cloned_attempts = attempts.clone();
  client
    .expect_query_instant()
    .returning(move |addr, _, _, _| {
      cloned_attempts.lock().push(addr.to_string());
      if addr == "good:9090" {
        Ok(vector_result(1.0))
      } else {
        Err(QueryError::Status(http::StatusCode::INTERNAL_SERVER_ERROR))
      }
    });

  let provider = provider_with(&collector.scope("test"), &["bad:9090", "good:9090"]).await;
  let func = make_func(
    client,
    provider,
    Arc::new(Cache::default()),
    PartialResponseStrategy::Abort,
    &collector,
  );

  let vector = func.eval("up", time::OffsetDateTime::UNIX_EPOCH).await.unwrap();
  assert_eq!(1, vector.len());
  // Every address is tried at most once per call.
  let attempts = attempts.lock();
  assert!(attempts.len() <= 2);
  assert_eq!("good:9090", attempts.last().unwrap());
}

#[tokio::test]
async fn all_addresses_failing_reports_no_peer() {
  let collector = Collector::default();
  let mut client = MockQueryClient::new();
  client
    .expect_query_instant()
    .times(2)
    .returning(|_, _, _, _| Err(QueryError::Status(http::StatusCode::BAD_GATEWAY)));

  let provider = provider_with(&collector.scope("test"), &["a:9090", "b:9090"]).await;
  let func = make_func(
    client,
    provider,
    Arc::new(Cache::default()),
    PartialResponseStrategy::Abort,
    &collector,
  );
  assert!(matches!(
    func.eval("up", time::OffsetDateTime::UNIX_EPOCH).await,
    Err(QueryError::NoQueryPeer)
  ));
}

#[tokio::test]
async fn warnings_increment_the_strategy_counter() {
  let collector = Collector::default();
  let mut client = MockQueryClient::new();
  client.expect_query_instant().returning(|_, _, _, _| {
    Ok(InstantQueryResult {
      vector: vec![Sample {
        labels: Labels::from_pairs([("job", "x")]),
        value: 1.0,
      }],
      warnings: vec!["store gateway X unreachable".to_string()],
    })
  });

  let provider = provider_with(&collector.scope("test"), &["a:9090"]).await;
  let func = make_func(
    client,
    provider,
    Arc::new(Cache::default()),
    PartialResponseStrategy::Warn,
    &collector,
  );

  let vector = func.eval("up", time::OffsetDateTime::UNIX_EPOCH).await.unwrap();
  assert_eq!(1, vector.len());
  assert!(collector.prometheus_output().contains(
    r#"thanos_rule_evaluation_with_warnings_total{strategy="warn"} 1"#
  ));
}

#[tokio::test]
async fn file_sd_addresses_are_merged_and_deduplicated() {
  let collector = Collector::default();
  let cache = Arc::new(Cache::default());
  cache.update(&[TargetGroup {
    targets: vec!["a:9090".to_string(), "b:9090".to_string()],
    labels: BTreeMap::new(),
  }]);

  let mut client = MockQueryClient::new();
  client
    .expect_query_instant()
    .returning(|_, _, _, _| Ok(vector_result(1.0)));

  let provider = provider_with(&collector.scope("test"), &["a:9090"]).await;
  let func = make_func(
    client,
    provider,
    cache,
    PartialResponseStrategy::Abort,
    &collector,
  );

  func.eval("up", time::OffsetDateTime::UNIX_EPOCH).await.unwrap();
  assert!(collector
    .prometheus_output()
    .contains("thanos_rule_duplicated_query_address 1"));
}

#[tokio::test]
async fn address_order_is_randomized() {
  let collector = Collector::default();
  let first_attempt = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

  let mut client = MockQueryClient::new();
  let cloned_first_attempt = first_attempt.clone();
  client
    .expect_query_instant()
    .returning(move |addr, _, _, _| {
      *cloned_first_attempt.lock().entry(addr.to_string()).or_default() += 1;
      Ok(vector_result(1.0))
    });

  let provider =
    provider_with(&collector.scope("test"), &["a:9090", "b:9090", "c:9090"]).await;
  let func = make_func(
    client,
    provider,
    Arc::new(Cache::default()),
    PartialResponseStrategy::Abort,
    &collector,
  );

  // Each call succeeds on the first attempt, so the tally records which address was drawn first.
  // Over 300 draws every address must appear: P(never drawing one) is (2/3)^300.
  for _ in 0 .. 300 {
    func.eval("up", time::OffsetDateTime::UNIX_EPOCH).await.unwrap();
  }
  let first_attempt = first_attempt.lock();
  assert_eq!(3, first_attempt.len());
  for count in first_attempt.values() {
    assert!(*count > 50, "skewed first-attempt distribution: {first_attempt:?}");
  }
}
