// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./group_test.rs"]
mod group_test;

use super::rule::{ActiveAlert, AlertingRule, RecordingRule, Rule};
use crate::labels::Labels;
use crate::query::QueryFunc;
use crate::tsdb::{Tsdb, timestamp_ms};
use prometheus::IntCounter;
use ruler_common::stats::Scope;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

// Callback invoked with the post-evaluation alert list of one alerting rule. The receiver
// filters Pending alerts, builds notifications, and queues them.
pub type NotifyFn = Arc<dyn Fn(&str, Vec<ActiveAlert>) + Send + Sync>;

//
// EvalStats
//

#[derive(Clone)]
pub struct EvalStats {
  pub evaluations_total: IntCounter,
  pub evaluation_failures_total: IntCounter,
}

impl EvalStats {
  // Registered under the rule-engine namespace the downstream dashboards expect.
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    Self {
      evaluations_total: scope.counter("evaluations_total"),
      evaluation_failures_total: scope.counter("evaluation_failures_total"),
    }
  }
}

//
// EvalContext
//

// Everything one rule evaluation needs. Shared by all groups of a manager.
pub struct EvalContext {
  pub query_func: QueryFunc,
  pub tsdb: Arc<Tsdb>,
  pub external_labels: Labels,
  pub notify: NotifyFn,
  pub stats: EvalStats,
}

//
// Group
//

// A named, ordered list of rules sharing an evaluation interval and a partial-response
// strategy. Exactly one live group exists per (file, name) within a process.
pub struct Group {
  pub file: String,
  pub name: String,
  pub interval: Duration,
  pub strategy: crate::query::PartialResponseStrategy,
  pub rules: Vec<Rule>,
}

impl Group {
  #[must_use]
  pub fn key(&self) -> (String, String) {
    (self.file.clone(), self.name.clone())
  }

  // Evaluate all rules in declared order at one shared timestamp. Rule failures are swallowed:
  // they are logged and counted, and the remaining rules still run.
  pub async fn eval(&mut self, ctx: &EvalContext, at: OffsetDateTime) {
    for rule in &mut self.rules {
      ctx.stats.evaluations_total.inc();
      let result = match rule {
        Rule::Recording(rule) => Self::eval_recording(ctx, rule, at).await,
        Rule::Alerting(rule) => Self::eval_alerting(ctx, rule, at).await,
      };
      if let Err(e) = result {
        ctx.stats.evaluation_failures_total.inc();
        log::warn!(
          "rule evaluation failed in group {} ({}): {e}",
          self.name,
          self.file
        );
      }
    }
  }

  async fn eval_recording(
    ctx: &EvalContext,
    rule: &RecordingRule,
    at: OffsetDateTime,
  ) -> anyhow::Result<()> {
    let vector = ctx.query_func.eval(&rule.expr, at).await?;
    let mut appender = ctx.tsdb.appender();
    let ts = timestamp_ms(at);
    for sample in vector {
      let labels = rule
        .output_labels(&sample.labels)
        .merged_with(&ctx.external_labels);
      appender.append(labels, ts, sample.value);
    }
    appender.commit();
    Ok(())
  }

  async fn eval_alerting(
    ctx: &EvalContext,
    rule: &mut AlertingRule,
    at: OffsetDateTime,
  ) -> anyhow::Result<()> {
    let vector = ctx.query_func.eval(&rule.expr, at).await?;
    let alerts = rule.eval_update(at, &vector);
    (ctx.notify)(&rule.expr, alerts);
    Ok(())
  }

  // Carry alert state over from the pre-reload incarnation of this group. Rules are matched by
  // name and expression; anything unmatched starts cold.
  pub fn adopt_state(&mut self, mut old: Self) {
    for rule in &mut self.rules {
      let Rule::Alerting(rule) = rule else {
        continue;
      };
      let matching = old.rules.iter_mut().find_map(|old_rule| match old_rule {
        Rule::Alerting(old_rule) if old_rule.name == rule.name && old_rule.expr == rule.expr => {
          Some(old_rule)
        },
        _ => None,
      });
      if let Some(old_rule) = matching {
        rule.restore_state(old_rule.take_state());
      }
    }
  }
}
