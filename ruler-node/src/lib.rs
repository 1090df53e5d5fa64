// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod config;

#[cfg(test)]
mod test;

use anyhow::Context;
use log::info;
use ruler_common::listener::ListenerBinder;
use ruler_common::shutdown::{ComponentShutdownTrigger, ComponentShutdownTriggerHandle};
use ruler_common::stats::Collector;
use ruler_engine::admin::AdminState;
use ruler_engine::alert::Notification;
use ruler_engine::alert::queue::{DEFAULT_CAPACITY, DEFAULT_MAX_BATCH, Queue};
use ruler_engine::alert::sender::{AlertmanagerSet, ReqwestAlertmanagerClient, Sender};
use ruler_engine::discovery::dns::{HickoryResolver, Provider, Resolver};
use ruler_engine::discovery::file_sd::{Cache, make_fetcher};
use ruler_engine::labels::parse_flag_labels;
use ruler_engine::objstore::FsBucket;
use ruler_engine::query::client::{QueryClient, ReqwestQueryClient};
use ruler_engine::query::{PartialResponseStrategy, QueryFunc, QueryStats};
use ruler_engine::rules::group::NotifyFn;
use ruler_engine::rules::manager::glob_rule_files;
use ruler_engine::rules::{AlertState, EvalContext, EvalStats, ManagerSet};
use ruler_engine::shipper::Shipper;
use ruler_engine::store::RulerStore;
use ruler_engine::tsdb::Tsdb;
use ruler_protobuf::store::store_server::StoreServer;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;

const ALERTMANAGER_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const SHIPPER_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const TSDB_MAINTENANCE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

fn ticker(period: std::time::Duration) -> tokio::time::Interval {
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker
}

// Builds every component and runs the long-lived loops under one run group: the first member to
// exit, cleanly or not, takes the whole process down. Exit status is the first error.
pub async fn run_server<ShutdownFuture: Future<Output = ()> + Send + 'static>(
  options: config::Options,
  listener_binder: Arc<dyn ListenerBinder>,
  shutdown: impl FnOnce() -> ShutdownFuture,
) -> anyhow::Result<()> {
  options.validate()?;
  let external_labels = parse_flag_labels(&options.labels).context("parse labels")?;
  let alert_query_url = options.resolve_alert_query_url()?;

  let collector = Collector::default();
  let scope = collector.scope("thanos");
  scope.gauge("heartbeat").set(1);

  let tsdb = Tsdb::open(
    &options.data_dir,
    ruler_engine::tsdb::Options {
      block_duration: options.tsdb_block_duration,
      retention: options.tsdb_retention,
    },
  )
  .context("open TSDB")?;

  let resolver: Arc<dyn Resolver> = Arc::new(HickoryResolver::new().context("build resolver")?);
  let dns_provider = Arc::new(Provider::new(
    &scope.scope("ruler_query_apis"),
    resolver.clone(),
    None,
  ));
  let file_sd_cache = Arc::new(Cache::default());
  let alertmanagers = Arc::new(AlertmanagerSet::new(
    options.alertmanagers_url.clone(),
    resolver,
  ));
  let am_resolution_errors = scope
    .scope("rule")
    .counter("alertmanager_address_resolution_errors");

  let queue = Arc::new(Queue::new(
    &scope,
    DEFAULT_CAPACITY,
    DEFAULT_MAX_BATCH,
    external_labels.clone(),
    options.alert_label_drop.clone(),
  ));
  let sender = Sender::new(
    &scope,
    alertmanagers.clone(),
    Arc::new(ReqwestAlertmanagerClient::new(
      options.alertmanagers_send_timeout,
    )),
  );

  // The notify path: drop Pending alerts, build notifications, queue them.
  let notify: NotifyFn = {
    let cloned_queue = queue.clone();
    Arc::new(move |expr, alerts| {
      let notifications: Vec<Notification> = alerts
        .into_iter()
        .filter(|alert| alert.state != AlertState::Pending)
        .map(|alert| Notification {
          starts_at: alert.fired_at.unwrap_or(alert.active_at),
          ends_at: alert.resolved_at,
          labels: alert.labels,
          annotations: alert.annotations,
          generator_url: config::generator_url(&alert_query_url, expr),
        })
        .collect();
      cloned_queue.push(notifications);
    })
  };

  let query_client: Arc<dyn QueryClient> =
    Arc::new(ReqwestQueryClient::new(options.eval_interval));
  let query_stats = QueryStats::new(&scope);
  let eval_stats = EvalStats::new(&collector.scope("prometheus_rule"));
  let make_ctx = |strategy| {
    Arc::new(EvalContext {
      query_func: QueryFunc::new(
        query_client.clone(),
        dns_provider.clone(),
        file_sd_cache.clone(),
        strategy,
        query_stats.clone(),
      ),
      tsdb: tsdb.clone(),
      external_labels: external_labels.clone(),
      notify: notify.clone(),
      stats: eval_stats.clone(),
    })
  };
  let manager_set = Arc::new(ManagerSet::new(
    &scope,
    make_ctx(PartialResponseStrategy::Abort),
    make_ctx(PartialResponseStrategy::Warn),
    options.eval_interval,
  ));

  // Reload events from startup, SIGHUP, and the admin endpoint all funnel through one channel.
  let (reload_tx, reload_rx) = mpsc::channel::<()>(1);
  let _ = reload_tx.try_send(());
  let admin_state = AdminState::new(
    collector.clone(),
    reload_tx.clone(),
    options.web_route_prefix.clone(),
  );

  // Bind the gRPC listener up front: a bind failure is a startup error.
  let grpc_socket = listener_binder
    .bind(&options.grpc_address)
    .await
    .context("listen gRPC address")?;
  info!("gRPC store server listening on: {}", grpc_socket.local_addr());

  let shutdown_trigger = ComponentShutdownTrigger::default();
  let handle = shutdown_trigger.make_handle();
  let mut members: JoinSet<anyhow::Result<()>> = JoinSet::new();

  spawn_sender_loop(&mut members, &handle, queue.clone(), sender);
  spawn_alertmanager_refresh(
    &mut members,
    &handle,
    alertmanagers,
    am_resolution_errors,
  );
  spawn_dns_refresh(
    &mut members,
    &handle,
    dns_provider,
    options.queries.clone(),
    options.query_sd_dns_interval.unsigned_abs(),
  );
  if !options.query_sd_files.is_empty() {
    spawn_file_sd(
      &mut members,
      &handle,
      file_sd_cache,
      options.query_sd_files.clone(),
      options.query_sd_interval.unsigned_abs(),
    );
  }
  spawn_reload_loop(
    &mut members,
    &handle,
    manager_set.clone(),
    options.rule_files.clone(),
    reload_rx,
  );
  spawn_sighup_loop(&mut members, &handle, reload_tx);
  spawn_tsdb_maintenance(&mut members, &handle, tsdb.clone());

  // gRPC store server.
  {
    let store = RulerStore::new(tsdb.clone(), external_labels.clone());
    let shutdown = handle.make_shutdown();
    let incoming = TcpListenerStream::new(grpc_socket.listen());
    members.spawn(async move {
      tonic::transport::Server::builder()
        .add_service(StoreServer::new(store))
        .serve_with_incoming_shutdown(incoming, async move { shutdown.cancelled().await })
        .await
        .context("serve gRPC")
    });
  }

  // Admin HTTP server.
  {
    let shutdown = handle.make_shutdown();
    let listener_binder = listener_binder.clone();
    let http_address = options.http_address.clone();
    members.spawn(async move {
      admin_state
        .spawn_server(listener_binder, &http_address, shutdown)
        .await
        .context("serve HTTP")
    });
  }

  // Block shipper, only when a bucket is configured.
  if let Some(objstore_path) = &options.objstore_path {
    let bucket = Arc::new(FsBucket::new(objstore_path).context("open object store bucket")?);
    let shipper = Shipper::new(
      &scope,
      &options.data_dir,
      bucket,
      external_labels.clone(),
    );
    let shutdown = handle.make_shutdown();
    members.spawn(async move {
      let mut ticker = ticker(SHIPPER_SYNC_INTERVAL);
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if let Err(e) = shipper.sync().await {
              log::warn!("block sync failed: {e}");
            }
          },
          () = shutdown.cancelled() => return Ok(()),
        }
      }
    });
  } else {
    info!("no object store bucket configured, uploads will be disabled");
  }

  // Termination signals.
  {
    let shutdown_future = shutdown();
    let shutdown = handle.make_shutdown();
    members.spawn(async move {
      tokio::select! {
        () = shutdown_future => {},
        () = shutdown.cancelled() => {},
      }
      Ok(())
    });
  }

  info!("starting rule node");
  let mut result = match members.join_next().await.expect("run group is non-empty") {
    Ok(result) => result,
    Err(e) => Err(e.into()),
  };
  info!("shutting down");

  shutdown_trigger.shutdown().await;
  while let Some(join_result) = members.join_next().await {
    match join_result {
      Ok(Ok(())) => {},
      Ok(Err(e)) => {
        if result.is_ok() {
          result = Err(e);
        } else {
          log::warn!("member failed during shutdown: {e}");
        }
      },
      Err(e) => log::warn!("member panicked during shutdown: {e}"),
    }
  }

  // Rule managers stop before the TSDB closes.
  manager_set.stop().await;
  tsdb.close().context("close TSDB")?;
  info!("runtime terminated");
  result
}

fn spawn_sender_loop(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  queue: Arc<Queue>,
  sender: Sender,
) {
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    while let Some(batch) = queue.pop(&shutdown).await {
      sender.send(&batch).await;
    }
    Ok(())
  });
}

fn spawn_alertmanager_refresh(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  alertmanagers: Arc<AlertmanagerSet>,
  resolution_errors: prometheus::IntCounter,
) {
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    let mut ticker = ticker(ALERTMANAGER_REFRESH_INTERVAL);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(e) = alertmanagers.update().await {
            resolution_errors.inc();
            log::error!("refreshing alertmanagers failed: {e}");
          }
        },
        () = shutdown.cancelled() => return Ok(()),
      }
    }
  });
}

fn spawn_dns_refresh(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  dns_provider: Arc<Provider>,
  static_queries: Vec<String>,
  period: std::time::Duration,
) {
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    let mut ticker = ticker(period);
    loop {
      tokio::select! {
        _ = ticker.tick() => dns_provider.resolve(&static_queries).await,
        () = shutdown.cancelled() => return Ok(()),
      }
    }
  });
}

fn spawn_file_sd(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  cache: Arc<Cache>,
  patterns: Vec<String>,
  period: std::time::Duration,
) {
  let mut rx = make_fetcher(patterns, Box::new(ticker(period)), handle.make_shutdown());
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    cache.update(&rx.borrow().clone());
    loop {
      tokio::select! {
        changed = rx.changed() => {
          if changed.is_err() {
            return Ok(());
          }
          let groups = rx.borrow_and_update().clone();
          cache.update(&groups);
        },
        () = shutdown.cancelled() => return Ok(()),
      }
    }
  });
}

fn spawn_reload_loop(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  manager_set: Arc<ManagerSet>,
  patterns: Vec<String>,
  mut reload_rx: mpsc::Receiver<()>,
) {
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    loop {
      tokio::select! {
        event = reload_rx.recv() => {
          if event.is_none() {
            return Ok(());
          }
          let files = glob_rule_files(&patterns);
          info!("reloading {} rule file(s)", files.len());
          match manager_set.update(&files).await {
            Ok(()) => info!("rule files reloaded at {}", OffsetDateTime::now_utc()),
            Err(e) => log::error!("reloading rules failed: {e}"),
          }
        },
        () = shutdown.cancelled() => return Ok(()),
      }
    }
  });
}

fn spawn_sighup_loop(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  reload_tx: mpsc::Sender<()>,
) {
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    loop {
      tokio::select! {
        _ = sighup.recv() => {
          info!("received SIGHUP, scheduling reload");
          let _ = reload_tx.try_send(());
        },
        () = shutdown.cancelled() => return Ok(()),
      }
    }
  });
}

fn spawn_tsdb_maintenance(
  members: &mut JoinSet<anyhow::Result<()>>,
  handle: &ComponentShutdownTriggerHandle,
  tsdb: Arc<Tsdb>,
) {
  let shutdown = handle.make_shutdown();
  members.spawn(async move {
    let mut ticker = ticker(TSDB_MAINTENANCE_INTERVAL);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let now = OffsetDateTime::now_utc();
          if let Err(e) = tsdb.compact(now) {
            log::warn!("block compaction failed: {e}");
          }
          if let Err(e) = tsdb.truncate(now) {
            log::warn!("retention enforcement failed: {e}");
          }
        },
        () = shutdown.cancelled() => return Ok(()),
      }
    }
  });
}
