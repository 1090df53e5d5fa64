// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod group;
pub mod manager;
pub mod rule;

use crate::labels::{is_valid_label_name, is_valid_metric_name};
use crate::query::PartialResponseStrategy;
use anyhow::{Context, bail};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use time::Duration;

pub use group::{EvalContext, EvalStats, Group};
pub use manager::{Manager, ManagerSet};
pub use rule::{ActiveAlert, AlertState, AlertingRule, RecordingRule, Rule};

// Parse a Prometheus-style duration string: one or more <number><unit> segments with units
// ms/s/m/h/d/w/y, e.g. "30s", "2h", "1h30m".
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
  if s.is_empty() {
    bail!("empty duration");
  }
  let mut total = Duration::ZERO;
  let mut rest = s;
  while !rest.is_empty() {
    let digits_end = rest
      .find(|c: char| !c.is_ascii_digit())
      .unwrap_or(rest.len());
    if digits_end == 0 {
      bail!("invalid duration {s:?}");
    }
    let value: i64 = rest[.. digits_end].parse()?;
    rest = &rest[digits_end ..];

    let (unit, len) = if rest.starts_with("ms") {
      (Duration::milliseconds(1), 2)
    } else if rest.starts_with('s') {
      (Duration::seconds(1), 1)
    } else if rest.starts_with('m') {
      (Duration::minutes(1), 1)
    } else if rest.starts_with('h') {
      (Duration::hours(1), 1)
    } else if rest.starts_with('d') {
      (Duration::days(1), 1)
    } else if rest.starts_with('w') {
      (Duration::weeks(1), 1)
    } else if rest.starts_with('y') {
      (Duration::days(365), 1)
    } else {
      bail!("invalid duration unit in {s:?}");
    };
    total += unit * value as i32;
    rest = &rest[len ..];
  }
  Ok(total)
}

fn deserialize_duration<'de, D: Deserializer<'de>>(
  deserializer: D,
) -> Result<Option<Duration>, D::Error> {
  let value: Option<String> = Option::deserialize(deserializer)?;
  value
    .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
    .transpose()
}

//
// Rule file model
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFileConfig {
  #[serde(default)]
  pub groups: Vec<RuleGroupConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroupConfig {
  pub name: String,
  #[serde(default, deserialize_with = "deserialize_duration")]
  pub interval: Option<Duration>,
  #[serde(default)]
  pub partial_response_strategy: Option<PartialResponseStrategy>,
  pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
  #[serde(default)]
  pub record: Option<String>,
  #[serde(default)]
  pub alert: Option<String>,
  pub expr: String,
  #[serde(default, rename = "for", deserialize_with = "deserialize_duration")]
  pub hold: Option<Duration>,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
  #[serde(default)]
  pub annotations: BTreeMap<String, String>,
}

impl RuleConfig {
  fn validate(&self) -> anyhow::Result<()> {
    match (&self.record, &self.alert) {
      (Some(record), None) => {
        if !is_valid_metric_name(record) {
          bail!("invalid recording rule name {record:?}");
        }
        if self.hold.is_some() {
          bail!("'for' is not allowed on recording rule {record:?}");
        }
        if !self.annotations.is_empty() {
          bail!("annotations are not allowed on recording rule {record:?}");
        }
      },
      (None, Some(alert)) => {
        if alert.is_empty() {
          bail!("empty alert name");
        }
      },
      _ => bail!("rule must set exactly one of 'record' and 'alert'"),
    }
    if self.expr.is_empty() {
      bail!("empty rule expression");
    }
    for name in self.labels.keys().chain(self.annotations.keys()) {
      if !is_valid_label_name(name) {
        bail!("invalid label name {name:?}");
      }
    }
    Ok(())
  }
}

// Parse one rule file into runtime groups. Any invalid group or rule fails the whole file so a
// reload never applies half a file.
pub fn load_groups(
  file: &str,
  contents: &str,
  default_interval: Duration,
) -> anyhow::Result<Vec<Group>> {
  let config: RuleFileConfig =
    serde_yaml::from_str(contents).with_context(|| format!("parse rule file {file}"))?;

  let mut seen_names = HashSet::new();
  let mut groups = Vec::with_capacity(config.groups.len());
  for group_config in config.groups {
    if group_config.name.is_empty() {
      bail!("group with empty name in {file}");
    }
    if !seen_names.insert(group_config.name.clone()) {
      bail!("duplicate group name {:?} in {file}", group_config.name);
    }
    let mut rules = Vec::with_capacity(group_config.rules.len());
    for rule_config in group_config.rules {
      rule_config
        .validate()
        .with_context(|| format!("group {:?} in {file}", group_config.name))?;
      rules.push(Rule::from_config(rule_config));
    }

    groups.push(Group {
      file: file.to_string(),
      name: group_config.name,
      interval: group_config.interval.unwrap_or(default_interval),
      strategy: group_config.partial_response_strategy.unwrap_or_default(),
      rules,
    });
  }
  Ok(groups)
}
