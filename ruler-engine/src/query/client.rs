// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./client_test.rs"]
mod client_test;

use super::{PartialResponseStrategy, QueryError};
use crate::labels::Labels;
use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// One instant-vector element: a label set and its value at the evaluation timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
  pub labels: Labels,
  pub value: f64,
}

pub type Vector = Vec<Sample>;

#[derive(Debug, Default)]
pub struct InstantQueryResult {
  pub vector: Vector,
  pub warnings: Vec<String>,
}

// The standard query result envelope.
#[derive(Deserialize)]
struct QueryResponse {
  status: String,
  #[serde(default)]
  data: Option<QueryData>,
  #[serde(default)]
  warnings: Vec<String>,
  #[serde(default)]
  error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
  #[serde(rename = "resultType")]
  result_type: String,
  result: Vec<VectorEntry>,
}

#[derive(Deserialize)]
struct VectorEntry {
  metric: Labels,
  // An instant value is encoded as [<unix seconds>, "<value>"].
  value: (f64, String),
}

pub fn decode_instant_query(body: &[u8]) -> Result<InstantQueryResult, QueryError> {
  let response: QueryResponse =
    serde_json::from_slice(body).map_err(|e| QueryError::Malformed(e.to_string()))?;
  if response.status != "success" {
    return Err(QueryError::Malformed(format!(
      "query failed: {}",
      response.error.unwrap_or_else(|| response.status.clone())
    )));
  }
  let data = response
    .data
    .ok_or_else(|| QueryError::Malformed("missing data section".to_string()))?;
  if data.result_type != "vector" {
    return Err(QueryError::Malformed(format!(
      "unexpected result type {:?}",
      data.result_type
    )));
  }

  let mut vector = Vector::with_capacity(data.result.len());
  for entry in data.result {
    let value = entry
      .value
      .1
      .parse()
      .map_err(|e| QueryError::Malformed(format!("bad sample value: {e}")))?;
    vector.push(Sample {
      labels: entry.metric,
      value,
    });
  }
  Ok(InstantQueryResult {
    vector,
    warnings: response.warnings,
  })
}

//
// QueryClient
//

/// A thin client wrapper used for mocking in tests.
#[mockall::automock]
#[async_trait]
pub trait QueryClient: Send + Sync {
  async fn query_instant(
    &self,
    addr: &str,
    query: &str,
    at: OffsetDateTime,
    strategy: PartialResponseStrategy,
  ) -> Result<InstantQueryResult, QueryError>;
}

pub struct ReqwestQueryClient {
  inner: reqwest::Client,
  timeout: time::Duration,
}

impl ReqwestQueryClient {
  #[must_use]
  pub fn new(timeout: time::Duration) -> Self {
    Self {
      inner: reqwest::Client::new(),
      timeout,
    }
  }
}

#[async_trait]
impl QueryClient for ReqwestQueryClient {
  async fn query_instant(
    &self,
    addr: &str,
    query: &str,
    at: OffsetDateTime,
    strategy: PartialResponseStrategy,
  ) -> Result<InstantQueryResult, QueryError> {
    let time = at
      .format(&Rfc3339)
      .map_err(|e| QueryError::Malformed(format!("bad evaluation timestamp: {e}")))?;
    let response = self
      .inner
      .post(format!("http://{addr}/api/v1/query"))
      .timeout(self.timeout.unsigned_abs())
      .form(&[
        ("query", query),
        ("time", time.as_str()),
        ("dedup", "true"),
        ("partial_response_strategy", strategy.as_str()),
      ])
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(QueryError::Status(response.status()));
    }

    decode_instant_query(&response.bytes().await?)
  }
}
