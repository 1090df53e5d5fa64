// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::config::Options;
use crate::run_server;
use axum::Json;
use axum::extract::State;
use axum::routing::post;
use pretty_assertions::assert_eq;
use ruler_common::listener::{BoundSocket, MockListenerBinder};
use ruler_protobuf::store::store_client::StoreClient;
use ruler_protobuf::store::{InfoRequest, SeriesRequest, StoreType};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::Duration as TimeDuration;
use tokio_stream::StreamExt;

// A query API stub answering every instant query with one fixed series.
async fn spawn_mock_query_server() -> SocketAddr {
  async fn handler() -> Json<Value> {
    Json(json!({
      "status": "success",
      "data": {
        "resultType": "vector",
        "result": [
          {"metric": {"job": "x", "instance": "i1"}, "value": [100, "2"]}
        ]
      }
    }))
  }

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let router = axum::Router::new().route("/api/v1/query", post(handler));
  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });
  addr
}

// An Alertmanager stub capturing every pushed alert batch.
async fn spawn_mock_alertmanager() -> (SocketAddr, Arc<Mutex<Vec<Value>>>) {
  async fn handler(
    State(received): State<Arc<Mutex<Vec<Value>>>>,
    Json(alerts): Json<Value>,
  ) -> &'static str {
    received.lock().unwrap().push(alerts);
    "ok"
  }

  let received = Arc::new(Mutex::new(Vec::new()));
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let router = axum::Router::new()
    .route("/api/v1/alerts", post(handler))
    .with_state(received.clone());
  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });
  (addr, received)
}

// Waits with a deadline for a background condition to become true.
async fn await_condition(mut condition: impl FnMut() -> bool) {
  for _ in 0 .. 200 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  panic!("condition not reached within deadline");
}

#[tokio::test(flavor = "multi_thread")]
async fn rule_node_end_to_end() {
  let query_addr = spawn_mock_query_server().await;
  let (am_addr, am_received) = spawn_mock_alertmanager().await;

  let data_dir = tempfile::tempdir().unwrap();
  let rules_dir = tempfile::tempdir().unwrap();
  std::fs::write(
    rules_dir.path().join("rules.yml"),
    r#"
groups:
- name: e2e
  interval: 100ms
  rules:
  - record: job:up:sum
    expr: sum by (job) (up)
  - alert: AlwaysFiring
    expr: vector(1)
    labels:
      severity: page
"#,
  )
  .unwrap();

  // Pre-bind the node's listeners on port 0 so their addresses are known up front.
  let grpc_socket = BoundSocket::bind("127.0.0.1:0").await.unwrap();
  let grpc_addr = grpc_socket.local_addr();
  let http_socket = BoundSocket::bind("localhost:0").await.unwrap();
  let http_addr = http_socket.local_addr();

  let sockets: Arc<Mutex<HashMap<String, BoundSocket>>> = Arc::new(Mutex::new(
    [
      ("grpc".to_string(), grpc_socket),
      ("http".to_string(), http_socket),
    ]
    .into(),
  ));
  let mut listener_binder = MockListenerBinder::new();
  listener_binder.expect_bind().returning(move |name| {
    sockets
      .lock()
      .unwrap()
      .remove(name)
      .ok_or_else(|| anyhow::anyhow!("unexpected bind {name}"))
  });

  let options = Options {
    labels: vec!["replica=\"A\"".to_string()],
    data_dir: data_dir.path().to_string_lossy().to_string(),
    rule_files: vec![rules_dir
      .path()
      .join("*.yml")
      .to_string_lossy()
      .to_string()],
    eval_interval: TimeDuration::milliseconds(100),
    tsdb_block_duration: TimeDuration::hours(2),
    tsdb_retention: TimeDuration::hours(48),
    alertmanagers_url: vec![format!("http://{am_addr}")],
    alertmanagers_send_timeout: TimeDuration::seconds(10),
    alert_query_url: Some("http://query.example".to_string()),
    alert_label_drop: vec!["severity".to_string()],
    web_route_prefix: String::new(),
    queries: vec![query_addr.to_string()],
    query_sd_files: Vec::new(),
    query_sd_interval: TimeDuration::minutes(5),
    query_sd_dns_interval: TimeDuration::seconds(30),
    objstore_path: None,
    grpc_address: "grpc".to_string(),
    http_address: "http".to_string(),
  };

  let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
  let server = tokio::spawn(run_server(options, Arc::new(listener_binder), move || {
    async move {
      let _ = shutdown_rx.await;
    }
  }));

  // An alert must reach the Alertmanager, relabeled: severity dropped, replica added.
  let cloned_am_received = am_received.clone();
  await_condition(move || !cloned_am_received.lock().unwrap().is_empty()).await;
  let batch = am_received.lock().unwrap().first().unwrap().clone();
  let alert = &batch.as_array().unwrap()[0];
  assert_eq!(
    json!({"alertname": "AlwaysFiring", "replica": "A"}),
    alert["labels"]
  );
  assert_eq!(
    "http://query.example/graph?g0.expr=vector%281%29&g0.tab=1",
    alert["generatorURL"]
  );

  // The admin surface serves metrics and accepts reloads.
  let metrics = reqwest::get(format!("http://{http_addr}/metrics"))
    .await
    .unwrap()
    .text()
    .await
    .unwrap();
  assert!(metrics.contains("thanos_rule_config_last_reload_successful 1"));
  assert!(metrics.contains("thanos_rule_loaded_rules"));
  let response = reqwest::Client::new()
    .post(format!("http://{http_addr}/-/reload"))
    .send()
    .await
    .unwrap();
  assert_eq!(200, response.status().as_u16());

  // The Store API serves the recorded series with external labels attached.
  let mut store = StoreClient::connect(format!("http://{grpc_addr}"))
    .await
    .unwrap();

  let info = store
    .info(InfoRequest {})
    .await
    .unwrap()
    .into_inner();
  assert_eq!(StoreType::Ruler, info.store_type());
  assert_eq!("replica", info.labels[0].name);

  let mut labels_by_series = Vec::new();
  let mut stream = store
    .series(SeriesRequest {
      min_time_ms: 0,
      max_time_ms: i64::MAX,
      matchers: Vec::new(),
    })
    .await
    .unwrap()
    .into_inner();
  while let Some(response) = stream.next().await {
    let series = response.unwrap().series.unwrap();
    let labels: HashMap<String, String> = series
      .labels
      .into_iter()
      .map(|l| (l.name, l.value))
      .collect();
    labels_by_series.push(labels);
  }
  let recorded = labels_by_series
    .iter()
    .find(|l| l.get("__name__").map(String::as_str) == Some("job:up:sum"))
    .expect("recorded series present");
  assert_eq!(Some("A"), recorded.get("replica").map(String::as_str));
  assert_eq!(Some("x"), recorded.get("job").map(String::as_str));

  // Clean shutdown with exit status 0.
  shutdown_tx.send(()).unwrap();
  server.await.unwrap().unwrap();
}
