// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod admin;
pub mod alert;
pub mod discovery;
pub mod labels;
pub mod objstore;
pub mod query;
pub mod rules;
pub mod shipper;
pub mod store;
pub mod tsdb;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  ruler_common::global_initialize();
}
