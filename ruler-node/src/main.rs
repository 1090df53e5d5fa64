// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use clap::Parser;
use log::info;
use ruler_common::global_initialize;
use ruler_common::listener::TcpListenerBinder;
use ruler_node::config::Options;
use ruler_node::run_server;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tikv_jemallocator::Jemalloc;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> anyhow::Result<()> {
  global_initialize();
  let options = Options::parse();

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::new(1).unwrap()
  });
  log::info!("running server with {num_threads} workers");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()
    .unwrap();

  runtime.block_on(async {
    run_server(options, Arc::new(TcpListenerBinder {}), || async {
      // Trap ctrl+c and sigterm messages and perform a clean shutdown.
      let mut sigint = signal(SignalKind::interrupt()).unwrap();
      let mut sigterm = signal(SignalKind::terminate()).unwrap();
      select! {
        _ = sigint.recv() => info!("received sigint"),
        _ = sigterm.recv() => info!("received sigterm"),
      }
    })
    .await
  })
}
