// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./stats_test.rs"]
mod stats_test;

use prometheus::{
  Histogram,
  HistogramOpts,
  IntCounter,
  IntCounterVec,
  IntGauge,
  IntGaugeVec,
  Opts,
  Registry,
  TextEncoder,
};
use std::collections::HashMap;

//
// Collector
//

// Owns the process metric registry. Scopes hand out individual metrics with hierarchical name
// prefixes joined by '_'.
#[derive(Clone, Default)]
pub struct Collector {
  registry: Registry,
}

impl Collector {
  #[must_use]
  pub fn scope(&self, name: &str) -> Scope {
    Scope {
      registry: self.registry.clone(),
      prefix: name.to_string(),
    }
  }

  #[must_use]
  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  // Render all registered metrics in the Prometheus text exposition format.
  #[must_use]
  pub fn prometheus_output(&self) -> String {
    TextEncoder::new()
      .encode_to_string(&self.registry.gather())
      .unwrap_or_default()
  }
}

//
// Scope
//

#[derive(Clone)]
pub struct Scope {
  registry: Registry,
  prefix: String,
}

impl Scope {
  #[must_use]
  pub fn scope(&self, name: &str) -> Self {
    Self {
      registry: self.registry.clone(),
      prefix: format!("{}_{name}", self.prefix),
    }
  }

  fn full_name(&self, name: &str) -> String {
    format!("{}_{name}", self.prefix)
  }

  #[must_use]
  pub fn counter(&self, name: &str) -> IntCounter {
    let counter = IntCounter::new(self.full_name(name), name.to_string()).unwrap();
    // A second registration of the same name keeps the first export; the returned instance is
    // still usable by the caller.
    let _ = self.registry.register(Box::new(counter.clone()));
    counter
  }

  #[must_use]
  pub fn counter_with_labels(&self, name: &str, labels: HashMap<String, String>) -> IntCounter {
    let opts = Opts::new(self.full_name(name), name.to_string()).const_labels(labels);
    let counter = IntCounter::with_opts(opts).unwrap();
    let _ = self.registry.register(Box::new(counter.clone()));
    counter
  }

  #[must_use]
  pub fn counter_vec(&self, name: &str, label_names: &[&str]) -> IntCounterVec {
    let opts = Opts::new(self.full_name(name), name.to_string());
    let counter = IntCounterVec::new(opts, label_names).unwrap();
    let _ = self.registry.register(Box::new(counter.clone()));
    counter
  }

  #[must_use]
  pub fn gauge(&self, name: &str) -> IntGauge {
    let gauge = IntGauge::new(self.full_name(name), name.to_string()).unwrap();
    let _ = self.registry.register(Box::new(gauge.clone()));
    gauge
  }

  #[must_use]
  pub fn gauge_vec(&self, name: &str, label_names: &[&str]) -> IntGaugeVec {
    let opts = Opts::new(self.full_name(name), name.to_string());
    let gauge = IntGaugeVec::new(opts, label_names).unwrap();
    let _ = self.registry.register(Box::new(gauge.clone()));
    gauge
  }

  #[must_use]
  pub fn histogram(&self, name: &str) -> Histogram {
    let opts = HistogramOpts::new(self.full_name(name), name.to_string());
    let histogram = Histogram::with_opts(opts).unwrap();
    let _ = self.registry.register(Box::new(histogram.clone()));
    histogram
  }
}
