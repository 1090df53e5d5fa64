// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod listener;
pub mod shutdown;
pub mod stats;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  global_initialize();
}

pub fn global_initialize() {
  // Tests call this from multiple crates so a second initialization must be a no-op.
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .try_init();
}
