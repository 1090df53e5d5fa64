// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;

// Run the shared contract suite against every available backend. An individual backend can be
// skipped with THANOS_SKIP_<BACKEND>_TESTS.
async fn foreach_bucket<F, Fut>(test_fn: F)
where
  F: Fn(Box<dyn Bucket>) -> Fut,
  Fut: std::future::Future<Output = ()>,
{
  test_fn(Box::new(InMemBucket::default())).await;

  if std::env::var_os("THANOS_SKIP_FILESYSTEM_TESTS").is_some() {
    log::info!("THANOS_SKIP_FILESYSTEM_TESTS set, skipping filesystem bucket");
  } else {
    let dir = tempfile::tempdir().unwrap();
    test_fn(Box::new(FsBucket::new(dir.path()).unwrap())).await;
  }
}

#[tokio::test]
async fn upload_get_round_trip() {
  foreach_bucket(|bucket| async move {
    let name = bucket.name();
    bucket
      .upload("block/meta.json", Bytes::from_static(b"{}"))
      .await
      .unwrap();

    assert!(bucket.exists("block/meta.json").await.unwrap(), "{name}");
    assert!(!bucket.exists("block/other").await.unwrap(), "{name}");
    assert_eq!(
      Bytes::from_static(b"{}"),
      bucket.get("block/meta.json").await.unwrap(),
      "{name}"
    );
  })
  .await;
}

#[tokio::test]
async fn upload_is_idempotent_by_key() {
  foreach_bucket(|bucket| async move {
    bucket.upload("k", Bytes::from_static(b"v1")).await.unwrap();
    bucket.upload("k", Bytes::from_static(b"v2")).await.unwrap();
    assert_eq!(Bytes::from_static(b"v2"), bucket.get("k").await.unwrap());

    let mut keys = Vec::new();
    bucket.iter("", &mut |key| keys.push(key)).await.unwrap();
    assert_eq!(vec!["k".to_string()], keys);
  })
  .await;
}

#[tokio::test]
async fn iter_honors_prefix_and_order() {
  foreach_bucket(|bucket| async move {
    for key in ["a/1", "a/2", "b/1"] {
      bucket.upload(key, Bytes::from_static(b"x")).await.unwrap();
    }

    let mut keys = Vec::new();
    bucket.iter("a/", &mut |key| keys.push(key)).await.unwrap();
    assert_eq!(vec!["a/1".to_string(), "a/2".to_string()], keys);
  })
  .await;
}

#[tokio::test]
async fn missing_objects_error() {
  foreach_bucket(|bucket| async move {
    assert!(matches!(
      bucket.get("missing").await,
      Err(ObjstoreError::NotFound(_))
    ));
    assert!(matches!(
      bucket.delete("missing").await,
      Err(ObjstoreError::NotFound(_))
    ));
  })
  .await;
}

#[tokio::test]
async fn delete_removes_the_object() {
  foreach_bucket(|bucket| async move {
    bucket.upload("k", Bytes::from_static(b"v")).await.unwrap();
    bucket.delete("k").await.unwrap();
    assert!(!bucket.exists("k").await.unwrap());
  })
  .await;
}
