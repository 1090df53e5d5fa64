// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./manager_test.rs"]
mod manager_test;

use super::group::{EvalContext, Group};
use super::load_groups;
use crate::query::PartialResponseStrategy;
use anyhow::Context;
use prometheus::{IntGauge, IntGaugeVec};
use ruler_common::shutdown::{ComponentShutdown, ComponentShutdownTrigger};
use ruler_common::stats::Scope;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;

// Expand the configured rule-file patterns. A bad pattern is logged and skipped; good patterns
// still contribute their files.
#[must_use]
pub fn glob_rule_files(patterns: &[String]) -> Vec<PathBuf> {
  let mut files = Vec::new();
  for pattern in patterns {
    match glob::glob(pattern) {
      Ok(paths) => files.extend(paths.flatten()),
      Err(e) => log::warn!("bad rule file pattern {pattern:?}: {e}"),
    }
  }
  files.sort();
  files
}

struct GroupHandle {
  trigger: ComponentShutdownTrigger,
  join: JoinHandle<Group>,
}

async fn run_group(mut group: Group, ctx: Arc<EvalContext>, shutdown: ComponentShutdown) -> Group {
  let mut ticker = tokio::time::interval(group.interval.unsigned_abs());
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        let at = OffsetDateTime::now_utc();
        group.eval(&ctx, at).await;
      },
      () = shutdown.cancelled() => break,
    }
  }
  // The group travels back to the manager so alert state survives a reload.
  group
}

//
// Manager
//

// Owns the group registry and evaluation tasks for one partial-response strategy.
pub struct Manager {
  strategy: PartialResponseStrategy,
  ctx: Arc<EvalContext>,
  registry: tokio::sync::Mutex<HashMap<(String, String), GroupHandle>>,
}

impl Manager {
  #[must_use]
  pub fn new(strategy: PartialResponseStrategy, ctx: Arc<EvalContext>) -> Self {
    Self {
      strategy,
      ctx,
      registry: tokio::sync::Mutex::new(HashMap::new()),
    }
  }

  #[must_use]
  pub const fn strategy(&self) -> PartialResponseStrategy {
    self.strategy
  }

  // Replace the full group registry. Groups that persist (same file + name) hand their alert
  // state to the replacement; removed groups simply stop, which makes their alerts inactive
  // without an outbound resolved notification.
  pub async fn update(&self, groups: Vec<Group>) {
    let mut registry = self.registry.lock().await;
    let old = std::mem::take(&mut *registry);

    let mut old_groups = HashMap::with_capacity(old.len());
    for (key, handle) in old {
      handle.trigger.shutdown().await;
      match handle.join.await {
        Ok(group) => {
          old_groups.insert(key, group);
        },
        Err(e) => log::warn!("group task for {key:?} did not stop cleanly: {e}"),
      }
    }

    for mut group in groups {
      debug_assert_eq!(self.strategy, group.strategy);
      let key = group.key();
      if let Some(old_group) = old_groups.remove(&key) {
        group.adopt_state(old_group);
      }
      let trigger = ComponentShutdownTrigger::default();
      let shutdown = trigger.make_shutdown();
      let join = tokio::spawn(run_group(group, self.ctx.clone(), shutdown));
      registry.insert(key, GroupHandle { trigger, join });
    }
  }

  // Drain in-flight evaluations and stop all group tasks.
  pub async fn stop(&self) {
    self.update(Vec::new()).await;
  }

  #[must_use]
  pub async fn group_count(&self) -> usize {
    self.registry.lock().await.len()
  }
}

//
// ManagerSet
//

struct ReloadStats {
  config_last_reload_successful: IntGauge,
  config_last_reload_success_timestamp_seconds: IntGauge,
  loaded_rules: IntGaugeVec,
}

// The pair of rule managers, one per partial-response strategy, plus the reload machinery they
// share. A reload is all-or-nothing: any unparsable file leaves both registries untouched.
pub struct ManagerSet {
  abort: Manager,
  warn: Manager,
  default_interval: Duration,
  stats: ReloadStats,
}

impl ManagerSet {
  #[must_use]
  pub fn new(
    scope: &Scope,
    abort_ctx: Arc<EvalContext>,
    warn_ctx: Arc<EvalContext>,
    default_interval: Duration,
  ) -> Self {
    let rule_scope = scope.scope("rule");
    Self {
      abort: Manager::new(PartialResponseStrategy::Abort, abort_ctx),
      warn: Manager::new(PartialResponseStrategy::Warn, warn_ctx),
      default_interval,
      stats: ReloadStats {
        config_last_reload_successful: rule_scope.gauge("config_last_reload_successful"),
        config_last_reload_success_timestamp_seconds: rule_scope
          .gauge("config_last_reload_success_timestamp_seconds"),
        loaded_rules: rule_scope.gauge_vec("loaded_rules", &["strategy", "file", "group"]),
      },
    }
  }

  #[must_use]
  pub const fn manager(&self, strategy: PartialResponseStrategy) -> &Manager {
    match strategy {
      PartialResponseStrategy::Abort => &self.abort,
      PartialResponseStrategy::Warn => &self.warn,
    }
  }

  // Parse the given rule files and swap both managers onto the new group set. Zero files is a
  // successful reload that leaves both managers empty.
  pub async fn update(&self, files: &[PathBuf]) -> anyhow::Result<()> {
    let result = self.try_update(files).await;
    if result.is_err() {
      self.stats.config_last_reload_successful.set(0);
    } else {
      self.stats.config_last_reload_successful.set(1);
      self
        .stats
        .config_last_reload_success_timestamp_seconds
        .set(OffsetDateTime::now_utc().unix_timestamp());
    }
    result
  }

  async fn try_update(&self, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut abort_groups = Vec::new();
    let mut warn_groups = Vec::new();
    for file in files {
      let file_name = file.to_string_lossy().to_string();
      let contents = std::fs::read_to_string(file)
        .with_context(|| format!("read rule file {file_name}"))?;
      for group in load_groups(&file_name, &contents, self.default_interval)? {
        match group.strategy {
          PartialResponseStrategy::Abort => abort_groups.push(group),
          PartialResponseStrategy::Warn => warn_groups.push(group),
        }
      }
    }

    self.stats.loaded_rules.reset();
    for group in abort_groups.iter().chain(warn_groups.iter()) {
      self
        .stats
        .loaded_rules
        .with_label_values(&[group.strategy.as_label(), &group.file, &group.name])
        .set(group.rules.len().try_into().unwrap_or(i64::MAX));
    }

    self.abort.update(abort_groups).await;
    self.warn.update(warn_groups).await;
    Ok(())
  }

  pub async fn stop(&self) {
    self.abort.stop().await;
    self.warn.stop().await;
  }
}
