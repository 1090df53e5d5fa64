// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use log::info;
use ruler_common::listener::ListenerBinder;
use ruler_common::shutdown::ComponentShutdown;
use ruler_common::stats::Collector;
use std::sync::Arc;
use tokio::sync::mpsc;

// jemalloc control names, null-terminated as mallctl requires.
const PROF_ACTIVE_CTL: &[u8] = b"prof.active\0";
const PROF_DUMP_CTL: &[u8] = b"prof.dump\0";
// Where heap dumps land. Null-terminated because jemalloc reads it as a C string.
const HEAP_DUMP_PATH: &[u8] = b"/tmp/ruler.heap\0";

//
// AdminState
//

// The node's HTTP surface: metrics, health, and the reload trigger.
pub struct AdminState {
  collector: Collector,
  reload_tx: mpsc::Sender<()>,
  route_prefix: String,
}

impl AdminState {
  #[must_use]
  pub fn new(collector: Collector, reload_tx: mpsc::Sender<()>, route_prefix: String) -> Arc<Self> {
    Arc::new(Self {
      collector,
      reload_tx,
      route_prefix,
    })
  }

  #[allow(clippy::unused_async)]
  async fn root() -> String {
    "ruler admin server".to_string()
  }

  #[allow(clippy::unused_async)]
  async fn healthcheck() -> String {
    "OK".to_string()
  }

  #[allow(clippy::unused_async)]
  async fn metrics(State(state): State<Arc<Self>>) -> Response {
    let buffer = state.collector.prometheus_output();
    Response::builder()
      .header(axum::http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
      .body(buffer.into())
      .unwrap()
  }

  // Returns 200 once the reload is enqueued. A reload already in flight makes this a no-op.
  #[allow(clippy::unused_async)]
  async fn reload(State(state): State<Arc<Self>>) -> StatusCode {
    let _ = state.reload_tx.try_send(());
    StatusCode::OK
  }

  fn set_profiling(active: bool) -> String {
    match unsafe { tikv_jemalloc_ctl::raw::write(PROF_ACTIVE_CTL, active) } {
      Ok(()) => format!("heap profiling {}", if active { "enabled" } else { "disabled" }),
      Err(e) => format!("error: {e}"),
    }
  }

  #[allow(clippy::unused_async)]
  async fn profile_enable() -> String {
    Self::set_profiling(true)
  }

  #[allow(clippy::unused_async)]
  async fn profile_disable() -> String {
    Self::set_profiling(false)
  }

  #[allow(clippy::unused_async)]
  async fn profile_dump() -> String {
    // prof.dump takes the target path by pointer, so the static path bytes are written as a
    // pointer-sized value.
    match unsafe { tikv_jemalloc_ctl::raw::write(PROF_DUMP_CTL, HEAP_DUMP_PATH.as_ptr()) } {
      Ok(()) => "dumped to /tmp/ruler.heap".to_string(),
      Err(e) => format!("error: {e}"),
    }
  }

  fn make_router(self: Arc<Self>) -> Router {
    let reload_routes = Router::new().route("/-/reload", post(Self::reload));
    let mut router = Router::new()
      .route("/", get(Self::root))
      .route("/healthcheck", get(Self::healthcheck))
      .route("/metrics", get(Self::metrics))
      .route("/debug/pprof/enable", post(Self::profile_enable))
      .route("/debug/pprof/disable", post(Self::profile_disable))
      .route("/debug/pprof/dump", post(Self::profile_dump));
    router = if self.route_prefix.is_empty() {
      router.merge(reload_routes)
    } else {
      router.nest(&self.route_prefix, reload_routes)
    };
    router.with_state(self)
  }

  pub async fn spawn_server(
    self: Arc<Self>,
    binder: Arc<dyn ListenerBinder>,
    bind: &str,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<()> {
    let router = self.make_router();
    let socket = binder.bind(bind).await?;
    info!("admin server starting on: {}", socket.local_addr());
    axum::serve(socket.listen(), router)
      .with_graceful_shutdown(async move { shutdown.cancelled().await })
      .await?;
    Ok(())
  }
}
