// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::labels::Labels;
use crate::tsdb::{SeriesEntry, Tsdb};
use regex::Regex;
use ruler_protobuf::store::label_matcher::Type as MatcherType;
use ruler_protobuf::store::store_server::Store;
use ruler_protobuf::store::{
  InfoRequest,
  InfoResponse,
  Label,
  LabelMatcher,
  LabelNamesRequest,
  LabelNamesResponse,
  LabelValuesRequest,
  LabelValuesResponse,
  Sample,
  Series,
  SeriesRequest,
  SeriesResponse,
  StoreType,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

// A compiled label matcher.
enum Matcher {
  Eq(String, String),
  Neq(String, String),
  Re(String, Regex),
  Nre(String, Regex),
}

impl Matcher {
  fn compile(matcher: &LabelMatcher) -> Result<Self, Status> {
    let make_regex = || {
      Regex::new(&format!("^(?:{})$", matcher.value))
        .map_err(|e| Status::invalid_argument(format!("bad matcher regex: {e}")))
    };
    Ok(match matcher.r#type() {
      MatcherType::Eq => Self::Eq(matcher.name.clone(), matcher.value.clone()),
      MatcherType::Neq => Self::Neq(matcher.name.clone(), matcher.value.clone()),
      MatcherType::Re => Self::Re(matcher.name.clone(), make_regex()?),
      MatcherType::Nre => Self::Nre(matcher.name.clone(), make_regex()?),
    })
  }

  fn matches(&self, labels: &Labels) -> bool {
    match self {
      Self::Eq(name, value) => labels.get(name).unwrap_or("") == value,
      Self::Neq(name, value) => labels.get(name).unwrap_or("") != value,
      Self::Re(name, regex) => regex.is_match(labels.get(name).unwrap_or("")),
      Self::Nre(name, regex) => !regex.is_match(labels.get(name).unwrap_or("")),
    }
  }
}

fn to_proto_labels(labels: &Labels) -> Vec<Label> {
  labels
    .iter()
    .map(|l| Label {
      name: l.name.clone(),
      value: l.value.clone(),
    })
    .collect()
}

//
// RulerStore
//

// Serves the node's local TSDB over the Store API so query servers can federate its data. Every
// series goes out with the external labels merged in, external winning on conflict.
pub struct RulerStore {
  tsdb: Arc<Tsdb>,
  external_labels: Labels,
}

impl RulerStore {
  #[must_use]
  pub fn new(tsdb: Arc<Tsdb>, external_labels: Labels) -> Self {
    Self {
      tsdb,
      external_labels,
    }
  }

  fn matching_series(
    &self,
    request: &SeriesRequest,
  ) -> Result<Vec<(Labels, SeriesEntry)>, Status> {
    let matchers: Vec<Matcher> = request
      .matchers
      .iter()
      .map(Matcher::compile)
      .collect::<Result<_, _>>()?;

    let entries = self
      .tsdb
      .series(request.min_time_ms, request.max_time_ms)
      .map_err(|e| Status::internal(format!("read series: {e}")))?;

    let mut out = Vec::new();
    for entry in entries {
      let labels = entry.labels.merged_with(&self.external_labels);
      if matchers.iter().all(|m| m.matches(&labels)) {
        out.push((labels, entry));
      }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
  }
}

#[tonic::async_trait]
impl Store for RulerStore {
  async fn info(&self, _request: Request<InfoRequest>) -> Result<Response<InfoResponse>, Status> {
    let (min_time_ms, max_time_ms) = self.tsdb.head_time_range();
    Ok(Response::new(InfoResponse {
      labels: to_proto_labels(&self.external_labels),
      min_time_ms,
      max_time_ms,
      store_type: StoreType::Ruler.into(),
    }))
  }

  type SeriesStream = ReceiverStream<Result<SeriesResponse, Status>>;

  async fn series(
    &self,
    request: Request<SeriesRequest>,
  ) -> Result<Response<Self::SeriesStream>, Status> {
    let series = self.matching_series(request.get_ref())?;

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
      for (labels, entry) in series {
        let response = SeriesResponse {
          series: Some(Series {
            labels: to_proto_labels(&labels),
            samples: entry
              .samples
              .iter()
              .map(|(timestamp_ms, value)| Sample {
                timestamp_ms: *timestamp_ms,
                value: *value,
              })
              .collect(),
          }),
        };
        if tx.send(Ok(response)).await.is_err() {
          break;
        }
      }
    });

    Ok(Response::new(ReceiverStream::new(rx)))
  }

  async fn label_names(
    &self,
    _request: Request<LabelNamesRequest>,
  ) -> Result<Response<LabelNamesResponse>, Status> {
    let entries = self
      .tsdb
      .series(i64::MIN, i64::MAX)
      .map_err(|e| Status::internal(format!("read series: {e}")))?;

    let mut names = BTreeSet::new();
    for entry in entries {
      for label in entry.labels.merged_with(&self.external_labels).iter() {
        names.insert(label.name.clone());
      }
    }
    Ok(Response::new(LabelNamesResponse {
      names: names.into_iter().collect(),
    }))
  }

  async fn label_values(
    &self,
    request: Request<LabelValuesRequest>,
  ) -> Result<Response<LabelValuesResponse>, Status> {
    let label = &request.get_ref().label;
    let entries = self
      .tsdb
      .series(i64::MIN, i64::MAX)
      .map_err(|e| Status::internal(format!("read series: {e}")))?;

    let mut values = BTreeSet::new();
    for entry in entries {
      if let Some(value) = entry.labels.merged_with(&self.external_labels).get(label) {
        values.insert(value.to_string());
      }
    }
    Ok(Response::new(LabelValuesResponse {
      values: values.into_iter().collect(),
    }))
  }
}
