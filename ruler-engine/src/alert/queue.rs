// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./queue_test.rs"]
mod queue_test;

use super::Notification;
use crate::labels::Labels;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use ruler_common::shutdown::ComponentShutdown;
use ruler_common::stats::Scope;
use std::collections::VecDeque;
use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 10000;
pub const DEFAULT_MAX_BATCH: usize = 100;

struct Stats {
  pushed_total: IntCounter,
  dropped_total: IntCounter,
  length: IntGauge,
  capacity: IntGauge,
}

//
// Queue
//

// Bounded FIFO of pending alert notifications. Push relabels (drop configured names, then merge
// external labels with the external set winning) and evicts the oldest entries on overflow;
// losing old alerts is preferred over back-pressuring rule evaluation since alerting rules
// re-fire on the next cycle.
pub struct Queue {
  capacity: usize,
  max_batch: usize,
  external_labels: Labels,
  drop_labels: Vec<String>,
  queue: Mutex<VecDeque<Notification>>,
  notify_on_push: Notify,
  stats: Stats,
}

impl Queue {
  #[must_use]
  pub fn new(
    scope: &Scope,
    capacity: usize,
    max_batch: usize,
    external_labels: Labels,
    drop_labels: Vec<String>,
  ) -> Self {
    let scope = scope.scope("alert_queue");
    let stats = Stats {
      pushed_total: scope.counter("alerts_pushed_total"),
      dropped_total: scope.counter("alerts_dropped_total"),
      length: scope.gauge("length"),
      capacity: scope.gauge("capacity"),
    };
    stats.capacity.set(capacity.try_into().unwrap_or(i64::MAX));

    Self {
      capacity,
      max_batch,
      external_labels,
      drop_labels,
      queue: Mutex::new(VecDeque::new()),
      notify_on_push: Notify::new(),
      stats,
    }
  }

  // Append alerts in order, relabeling each one. If capacity would be exceeded the oldest
  // entries are evicted first.
  pub fn push(&self, alerts: Vec<Notification>) {
    if alerts.is_empty() {
      return;
    }
    self
      .stats
      .pushed_total
      .inc_by(alerts.len().try_into().unwrap_or(0));

    let mut queue = self.queue.lock();
    let overflow = (queue.len() + alerts.len()).saturating_sub(self.capacity);
    if overflow > 0 {
      let evicted = overflow.min(queue.len());
      queue.drain(0 .. evicted);
      self
        .stats
        .dropped_total
        .inc_by(evicted.try_into().unwrap_or(0));
      log::warn!("alert queue full, dropped {overflow} old alert(s)");
    }

    for mut alert in alerts {
      alert.labels = alert
        .labels
        .without(&self.drop_labels)
        .merged_with(&self.external_labels);
      queue.push_back(alert);
    }
    // A Push larger than the whole queue capacity keeps only the newest entries.
    while queue.len() > self.capacity {
      queue.pop_front();
      self.stats.dropped_total.inc();
    }
    self
      .stats
      .length
      .set(queue.len().try_into().unwrap_or(i64::MAX));

    self.notify_on_push.notify_waiters();
  }

  // Block until at least one alert is queued or shutdown is signaled. Returns up to max-batch
  // alerts in FIFO order, or None on shutdown once the queue is drained.
  pub async fn pop(&self, shutdown: &ComponentShutdown) -> Option<Vec<Notification>> {
    loop {
      let notified_future = {
        let mut queue = self.queue.lock();
        if !queue.is_empty() {
          let len = queue.len().min(self.max_batch);
          let batch: Vec<Notification> = queue.drain(0 .. len).collect();
          self
            .stats
            .length
            .set(queue.len().try_into().unwrap_or(i64::MAX));
          return Some(batch);
        }
        if shutdown.is_cancelled() {
          return None;
        }

        // enable() consumes a pending notify_waiters() before the lock is dropped so a
        // concurrent push is never missed.
        let mut notified_future = Box::pin(self.notify_on_push.notified());
        notified_future.as_mut().enable();
        notified_future
      };

      tokio::select! {
        () = notified_future => {},
        () = shutdown.cancelled() => {},
      }
    }
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.queue.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.queue.lock().is_empty()
  }
}
