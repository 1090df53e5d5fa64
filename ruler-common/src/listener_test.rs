// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;

#[tokio::test]
async fn port_zero_bind_reports_the_real_address() {
  let socket = BoundSocket::bind("127.0.0.1:0").await.unwrap();
  let address = socket.local_addr();
  assert_ne!(0, address.port());

  // The address stays reachable once listening starts.
  let listener = socket.listen();
  let connect = tokio::net::TcpStream::connect(address);
  let (accepted, connected) = tokio::join!(listener.accept(), connect);
  accepted.unwrap();
  connected.unwrap();
}

#[tokio::test]
async fn unresolvable_address_is_an_error() {
  assert!(BoundSocket::bind("not an address").await.is_err());
}

#[tokio::test]
async fn binder_trait_binds_through_the_real_implementation() {
  let binder = TcpListenerBinder {};
  let socket = binder.bind("localhost:0").await.unwrap();
  assert_ne!(0, socket.local_addr().port());
}
