// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./labels_test.rs"]
mod labels_test;

use anyhow::bail;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const METRIC_NAME_LABEL: &str = "__name__";
pub const ALERT_NAME_LABEL: &str = "alertname";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
  pub name: String,
  pub value: String,
}

//
// Labels
//

// An immutable label set, canonically sorted by name with unique names. Serializes as a flat
// name -> value map which is both the Alertmanager wire shape and the instant query metric shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
  #[must_use]
  pub fn new(mut labels: Vec<Label>) -> Self {
    labels.sort();
    labels.dedup_by(|a, b| a.name == b.name);
    Self(labels)
  }

  pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
    Self::new(
      pairs
        .into_iter()
        .map(|(name, value)| Label {
          name: name.to_string(),
          value: value.to_string(),
        })
        .collect(),
    )
  }

  #[must_use]
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .binary_search_by(|l| l.name.as_str().cmp(name))
      .ok()
      .map(|i| self.0[i].value.as_str())
  }

  // Merge, with `over` winning on name conflicts.
  #[must_use]
  pub fn merged_with(&self, over: &Self) -> Self {
    let mut out: BTreeMap<&str, &str> = self
      .0
      .iter()
      .map(|l| (l.name.as_str(), l.value.as_str()))
      .collect();
    for l in &over.0 {
      out.insert(&l.name, &l.value);
    }
    Self::from_pairs(out)
  }

  #[must_use]
  pub fn with(&self, name: &str, value: &str) -> Self {
    self.merged_with(&Self::from_pairs([(name, value)]))
  }

  #[must_use]
  pub fn without(&self, names: &[String]) -> Self {
    Self(
      self
        .0
        .iter()
        .filter(|l| !names.iter().any(|n| *n == l.name))
        .cloned()
        .collect(),
    )
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Label> {
    self.0.iter()
  }

  // Stable identity of the set, used to key active alert series.
  #[must_use]
  pub fn fingerprint(&self) -> u64 {
    let mut hasher = DefaultHasher::new();
    self.0.hash(&mut hasher);
    hasher.finish()
  }
}

impl std::fmt::Display for Labels {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{{")?;
    for (i, l) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}=\"{}\"", l.name, l.value)?;
    }
    write!(f, "}}")
  }
}

impl Serialize for Labels {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.0.len()))?;
    for l in &self.0 {
      map.serialize_entry(&l.name, &l.value)?;
    }
    map.end()
  }
}

impl<'de> Deserialize<'de> for Labels {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct LabelsVisitor;

    impl<'de> Visitor<'de> for LabelsVisitor {
      type Value = Labels;

      fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a map of label names to values")
      }

      fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut labels = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, value)) = access.next_entry::<String, String>()? {
          labels.push(Label { name, value });
        }
        Ok(Labels::new(labels))
      }
    }

    deserializer.deserialize_map(LabelsVisitor)
  }
}

// Prometheus label name grammar: [a-zA-Z_][a-zA-Z0-9_]*.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
  let mut chars = name.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Metric names additionally allow ':' for recording rule output names.
#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
  let mut chars = name.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

// Parse repeated --label flags of the form name="value".
pub fn parse_flag_labels(flags: &[String]) -> anyhow::Result<Labels> {
  let mut labels = Vec::with_capacity(flags.len());
  for flag in flags {
    let Some((name, value)) = flag.split_once('=') else {
      bail!("unrecognized label {flag:?}, expected name=\"value\"");
    };
    if !is_valid_label_name(name) {
      bail!("unsupported label name in {flag:?}");
    }
    let value = value
      .strip_prefix('"')
      .and_then(|v| v.strip_suffix('"'))
      .unwrap_or(value);
    labels.push(Label {
      name: name.to_string(),
      value: value.to_string(),
    });
  }
  Ok(Labels::new(labels))
}
