// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::labels::Labels;
use crate::objstore::InMemBucket;
use crate::tsdb::{Options, Tsdb, timestamp_ms};
use pretty_assertions::assert_eq;
use ruler_common::stats::Collector;
use time::OffsetDateTime;

struct TestSetup {
  tsdb: Arc<Tsdb>,
  bucket: Arc<InMemBucket>,
  shipper: Shipper,
  _data_dir: tempfile::TempDir,
}

fn make_setup() -> TestSetup {
  let data_dir = tempfile::tempdir().unwrap();
  let tsdb = Tsdb::open(data_dir.path(), Options::default()).unwrap();
  let bucket = Arc::new(InMemBucket::default());
  let shipper = Shipper::new(
    &Collector::default().scope("thanos"),
    data_dir.path(),
    bucket.clone(),
    Labels::from_pairs([("replica", "A")]),
  );
  TestSetup {
    tsdb,
    bucket,
    shipper,
    _data_dir: data_dir,
  }
}

// Cut one block covering samples two block-windows in the past.
fn cut_block(tsdb: &Arc<Tsdb>) -> String {
  let now = OffsetDateTime::now_utc();
  let mut appender = tsdb.appender();
  appender.append(
    Labels::from_pairs([("job", "x")]),
    timestamp_ms(now) - 3 * 3_600_000,
    1.0,
  );
  appender.commit();
  let cut = tsdb.compact(now).unwrap();
  assert_eq!(1, cut.len());
  cut[0].to_string()
}

#[tokio::test]
async fn uploads_new_blocks_and_records_them() {
  let setup = make_setup();
  let ulid = cut_block(&setup.tsdb);

  assert_eq!(1, setup.shipper.sync().await.unwrap());

  let keys = setup.bucket.keys();
  assert!(keys.contains(&format!("{ulid}/meta.json")), "{keys:?}");
  assert!(keys.contains(&format!("{ulid}/series.json")), "{keys:?}");

  let index = ShipperMeta::read_from(setup.tsdb.data_dir()).unwrap();
  assert_eq!(vec![ulid.clone()], index.uploaded);

  // The uploaded meta carries the external labels and the origin source.
  let uploaded_meta: BlockMeta =
    serde_json::from_slice(&setup.bucket.get(&format!("{ulid}/meta.json")).await.unwrap())
      .unwrap();
  let thanos = uploaded_meta.thanos.unwrap();
  assert_eq!("RULER", thanos.source);
  assert_eq!(Some(&"A".to_string()), thanos.labels.get("replica"));
}

#[tokio::test]
async fn shipped_blocks_are_not_reuploaded() {
  let setup = make_setup();
  cut_block(&setup.tsdb);

  assert_eq!(1, setup.shipper.sync().await.unwrap());
  let keys_before = setup.bucket.keys();

  // A second sync is a no-op and the bucket is byte-identical.
  assert_eq!(0, setup.shipper.sync().await.unwrap());
  assert_eq!(keys_before, setup.bucket.keys());
}

#[tokio::test]
async fn sync_with_no_blocks_is_empty() {
  let setup = make_setup();
  assert_eq!(0, setup.shipper.sync().await.unwrap());
  assert!(setup.bucket.keys().is_empty());
}

#[tokio::test]
async fn index_round_trips_through_its_file() {
  let dir = tempfile::tempdir().unwrap();
  let meta = ShipperMeta {
    version: 1,
    uploaded: vec!["01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()],
  };
  meta.write_to(dir.path()).unwrap();
  assert_eq!(meta, ShipperMeta::read_from(dir.path()).unwrap());
}
