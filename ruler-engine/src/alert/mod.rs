// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod queue;
pub mod sender;

use crate::labels::Labels;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// A single alert notification as posted to the Alertmanager v1 API. Pure value type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub labels: Labels,
  pub annotations: Labels,
  #[serde(rename = "startsAt", with = "time::serde::rfc3339")]
  pub starts_at: OffsetDateTime,
  #[serde(
    rename = "endsAt",
    with = "time::serde::rfc3339::option",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub ends_at: Option<OffsetDateTime>,
  #[serde(rename = "generatorURL")]
  pub generator_url: String,
}
