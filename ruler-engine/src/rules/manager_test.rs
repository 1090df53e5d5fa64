// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::discovery::dns::{MockResolver, Provider};
use crate::discovery::file_sd::Cache;
use crate::labels::Labels;
use crate::query::client::{InstantQueryResult, MockQueryClient, Sample};
use crate::query::{QueryFunc, QueryStats};
use crate::rules::group::EvalStats;
use crate::tsdb::{Options, Tsdb};
use parking_lot::Mutex as ParkingMutex;
use pretty_assertions::assert_eq;
use ruler_common::stats::Collector;

struct TestSetup {
  collector: Collector,
  manager_set: ManagerSet,
  notified: Arc<ParkingMutex<Vec<String>>>,
  _data_dir: tempfile::TempDir,
}

// Both strategies share one mock-backed query function answering a single firing series.
async fn make_setup() -> TestSetup {
  let collector = Collector::default();
  let scope = collector.scope("thanos");
  let data_dir = tempfile::tempdir().unwrap();
  let tsdb = Tsdb::open(data_dir.path(), Options::default()).unwrap();
  let notified = Arc::new(ParkingMutex::new(Vec::new()));

  let make_ctx = |strategy| {
    let mut client = MockQueryClient::new();
    client.expect_query_instant().returning(|_, _, _, _| {
      Ok(InstantQueryResult {
        vector: vec![Sample {
          labels: Labels::from_pairs([("job", "x")]),
          value: 1.0,
        }],
        warnings: Vec::new(),
      })
    });
    let provider = Arc::new(Provider::new(
      &scope.scope("test"),
      Arc::new(MockResolver::new()),
      None,
    ));
    let cloned_notified = notified.clone();
    let ctx = Arc::new(EvalContext {
      query_func: QueryFunc::new(
        Arc::new(client),
        provider.clone(),
        Arc::new(Cache::default()),
        strategy,
        QueryStats::new(&scope),
      ),
      tsdb: tsdb.clone(),
      external_labels: Labels::default(),
      notify: Arc::new(move |expr: &str, _alerts| {
        cloned_notified.lock().push(expr.to_string());
      }),
      stats: EvalStats::new(&collector.scope("prometheus_rule")),
    });
    (ctx, provider)
  };

  let (abort_ctx, abort_provider) = make_ctx(PartialResponseStrategy::Abort);
  let (warn_ctx, warn_provider) = make_ctx(PartialResponseStrategy::Warn);
  abort_provider.resolve(&["query:9090".to_string()]).await;
  warn_provider.resolve(&["query:9090".to_string()]).await;
  let manager_set = ManagerSet::new(&scope, abort_ctx, warn_ctx, Duration::seconds(30));

  TestSetup {
    collector,
    manager_set,
    notified,
    _data_dir: data_dir,
  }
}

fn write_rules(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, contents).unwrap();
  path
}

const MIXED_STRATEGY_RULES: &str = r#"
groups:
- name: abort-group
  rules:
  - record: job:up:sum
    expr: sum by (job) (up)
- name: warn-group
  partial_response_strategy: warn
  rules:
  - alert: JobDown
    expr: up == 0
"#;

#[tokio::test]
async fn zero_rule_files_is_a_successful_reload() {
  let setup = make_setup().await;
  setup.manager_set.update(&[]).await.unwrap();

  assert_eq!(
    0,
    setup
      .manager_set
      .manager(PartialResponseStrategy::Abort)
      .group_count()
      .await
  );
  assert!(setup
    .collector
    .prometheus_output()
    .contains("thanos_rule_config_last_reload_successful 1"));
  setup.manager_set.stop().await;
}

#[tokio::test]
async fn groups_are_routed_by_strategy() {
  let setup = make_setup().await;
  let dir = tempfile::tempdir().unwrap();
  let file = write_rules(dir.path(), "rules.yml", MIXED_STRATEGY_RULES);

  setup.manager_set.update(&[file]).await.unwrap();
  assert_eq!(
    1,
    setup
      .manager_set
      .manager(PartialResponseStrategy::Abort)
      .group_count()
      .await
  );
  assert_eq!(
    1,
    setup
      .manager_set
      .manager(PartialResponseStrategy::Warn)
      .group_count()
      .await
  );

  let output = setup.collector.prometheus_output();
  assert!(output.contains(r#"group="abort-group""#));
  assert!(output.contains(r#"strategy="warn""#));
  setup.manager_set.stop().await;
}

#[tokio::test]
async fn failed_reload_preserves_the_live_registry() {
  let setup = make_setup().await;
  let dir = tempfile::tempdir().unwrap();
  let good = write_rules(dir.path(), "good.yml", MIXED_STRATEGY_RULES);
  setup.manager_set.update(&[good.clone()]).await.unwrap();

  let bad = write_rules(dir.path(), "bad.yml", "groups: [{name: g, rules: [{expr: up}]}]");
  assert!(setup.manager_set.update(&[good, bad]).await.is_err());

  // Both managers keep their pre-reload groups and the gauge reports the failure.
  assert_eq!(
    1,
    setup
      .manager_set
      .manager(PartialResponseStrategy::Abort)
      .group_count()
      .await
  );
  assert_eq!(
    1,
    setup
      .manager_set
      .manager(PartialResponseStrategy::Warn)
      .group_count()
      .await
  );
  assert!(setup
    .collector
    .prometheus_output()
    .contains("thanos_rule_config_last_reload_successful 0"));
  setup.manager_set.stop().await;
}

#[tokio::test(start_paused = true)]
async fn groups_evaluate_and_notify() {
  let setup = make_setup().await;
  let dir = tempfile::tempdir().unwrap();
  let file = write_rules(
    dir.path(),
    "rules.yml",
    r#"
groups:
- name: g
  interval: 1s
  rules:
  - alert: JobDown
    expr: up == 0
"#,
  );
  setup.manager_set.update(&[file]).await.unwrap();

  // The group's first tick is immediate; wait for the notify callback under virtual time.
  for _ in 0 .. 100 {
    if !setup.notified.lock().is_empty() {
      break;
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
  }
  assert_eq!("up == 0", setup.notified.lock()[0]);
  setup.manager_set.stop().await;
}

#[tokio::test]
async fn reload_with_unchanged_file_keeps_exactly_one_group() {
  let setup = make_setup().await;
  let dir = tempfile::tempdir().unwrap();
  let file = write_rules(dir.path(), "rules.yml", MIXED_STRATEGY_RULES);

  setup.manager_set.update(&[file.clone()]).await.unwrap();
  setup.manager_set.update(&[file]).await.unwrap();
  assert_eq!(
    1,
    setup
      .manager_set
      .manager(PartialResponseStrategy::Abort)
      .group_count()
      .await
  );
  setup.manager_set.stop().await;
}

#[test]
fn globbing_skips_bad_patterns() {
  let dir = tempfile::tempdir().unwrap();
  write_rules(dir.path(), "a.yml", "groups: []");
  write_rules(dir.path(), "b.yml", "groups: []");

  let files = glob_rule_files(&[
    dir.path().join("*.yml").to_string_lossy().to_string(),
    "[".to_string(),
  ]);
  assert_eq!(2, files.len());
}
