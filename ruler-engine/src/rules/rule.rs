// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./rule_test.rs"]
mod rule_test;

use super::RuleConfig;
use crate::labels::{ALERT_NAME_LABEL, Labels, METRIC_NAME_LABEL};
use crate::query::client::Vector;
use std::collections::{HashMap, HashSet};
use time::{Duration, OffsetDateTime};

#[derive(Debug)]
pub enum Rule {
  Recording(RecordingRule),
  Alerting(AlertingRule),
}

impl Rule {
  #[must_use]
  pub fn from_config(config: RuleConfig) -> Self {
    let labels = Labels::from_pairs(
      config
        .labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str())),
    );
    match (config.record, config.alert) {
      (Some(record), None) => Self::Recording(RecordingRule {
        record,
        expr: config.expr,
        labels,
      }),
      (None, Some(alert)) => Self::Alerting(AlertingRule {
        name: alert,
        expr: config.expr,
        hold: config.hold.unwrap_or(Duration::ZERO),
        labels,
        annotations: Labels::from_pairs(
          config
            .annotations
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
        ),
        active: HashMap::new(),
      }),
      // Guarded by RuleConfig::validate() before construction.
      _ => unreachable!("rule config must carry exactly one of record/alert"),
    }
  }

  #[must_use]
  pub fn expr(&self) -> &str {
    match self {
      Self::Recording(r) => &r.expr,
      Self::Alerting(r) => &r.expr,
    }
  }
}

//
// RecordingRule
//

#[derive(Debug)]
pub struct RecordingRule {
  pub record: String,
  pub expr: String,
  pub labels: Labels,
}

impl RecordingRule {
  // Output labels for one query sample: rule labels win over query labels, then the output
  // metric name replaces whatever name the sample carried.
  #[must_use]
  pub fn output_labels(&self, sample_labels: &Labels) -> Labels {
    sample_labels
      .merged_with(&self.labels)
      .with(METRIC_NAME_LABEL, &self.record)
  }
}

//
// AlertingRule
//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AlertState {
  Pending,
  Firing,
}

// One active alert series tracked by an alerting rule.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveAlert {
  pub labels: Labels,
  pub annotations: Labels,
  pub state: AlertState,
  pub active_at: OffsetDateTime,
  pub fired_at: Option<OffsetDateTime>,
  pub resolved_at: Option<OffsetDateTime>,
  pub value: f64,
}

#[derive(Debug)]
pub struct AlertingRule {
  pub name: String,
  pub expr: String,
  pub hold: Duration,
  pub labels: Labels,
  pub annotations: Labels,
  // Active series fingerprint -> alert state. Owned exclusively by the evaluating rule.
  active: HashMap<u64, ActiveAlert>,
}

impl AlertingRule {
  // Fold one evaluation result into the state machine and return the post-evaluation alert
  // list (Firing plus recently resolved; Pending entries are included and filtered by the
  // notify path).
  pub fn eval_update(&mut self, at: OffsetDateTime, vector: &Vector) -> Vec<ActiveAlert> {
    let mut seen = HashSet::with_capacity(vector.len());
    for sample in vector {
      let labels = sample
        .labels
        .without(&[METRIC_NAME_LABEL.to_string()])
        .merged_with(&self.labels)
        .with(ALERT_NAME_LABEL, &self.name);
      let fingerprint = labels.fingerprint();
      seen.insert(fingerprint);

      match self.active.entry(fingerprint) {
        std::collections::hash_map::Entry::Occupied(mut entry) => {
          let alert = entry.get_mut();
          alert.value = sample.value;
          if alert.resolved_at.is_some() {
            // The series resolved and came back: a fresh activation.
            alert.state = AlertState::Pending;
            alert.active_at = at;
            alert.fired_at = None;
            alert.resolved_at = None;
          }
        },
        std::collections::hash_map::Entry::Vacant(entry) => {
          entry.insert(ActiveAlert {
            labels,
            annotations: self.annotations.clone(),
            state: AlertState::Pending,
            active_at: at,
            fired_at: None,
            resolved_at: None,
            value: sample.value,
          });
        },
      }
    }

    let hold = self.hold;
    self.active.retain(|fingerprint, alert| {
      if seen.contains(fingerprint) {
        if alert.state == AlertState::Pending && at - alert.active_at >= hold {
          alert.state = AlertState::Firing;
          alert.fired_at = Some(at);
        }
        return true;
      }
      // Absent from this evaluation.
      if alert.state == AlertState::Pending {
        return false;
      }
      if alert.resolved_at.is_none() {
        // First absence: keep the alert around once more so a resolved notification goes out.
        alert.resolved_at = Some(at);
        return true;
      }
      // Second consecutive absence: Inactive.
      false
    });

    let mut alerts: Vec<ActiveAlert> = self.active.values().cloned().collect();
    alerts.sort_by(|a, b| a.labels.cmp(&b.labels));
    alerts
  }

  // State handoff across a reload that kept this rule.
  #[must_use]
  pub fn take_state(&mut self) -> HashMap<u64, ActiveAlert> {
    std::mem::take(&mut self.active)
  }

  pub fn restore_state(&mut self, state: HashMap<u64, ActiveAlert>) {
    self.active = state;
  }

  #[must_use]
  pub fn active_len(&self) -> usize {
    self.active.len()
  }
}
