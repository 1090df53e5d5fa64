// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./listener_test.rs"]
mod listener_test;

use anyhow::Context;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, lookup_host};

//
// BoundSocket
//

// A TCP socket that is bound but not yet listening. Splitting bind from listen lets callers,
// and tests binding port 0, learn the local address before connections are accepted.
pub struct BoundSocket {
  socket: TcpSocket,
}

impl BoundSocket {
  // The node owns exactly one socket per listener flag, so only the first resolved address is
  // bound and any failure surfaces directly.
  pub async fn bind(address: &str) -> anyhow::Result<Self> {
    let resolved = lookup_host(address)
      .await
      .with_context(|| format!("resolve listen address {address:?}"))?
      .next()
      .with_context(|| format!("listen address {address:?} resolves to nothing"))?;
    let socket = match resolved {
      SocketAddr::V4(_) => TcpSocket::new_v4()?,
      SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket
      .bind(resolved)
      .with_context(|| format!("bind {resolved}"))?;
    Ok(Self { socket })
  }

  #[must_use]
  pub fn local_addr(&self) -> SocketAddr {
    self.socket.local_addr().expect("socket is bound")
  }

  #[must_use]
  pub fn listen(self) -> TcpListener {
    // listen() on a bound socket has no failure mode worth surfacing to callers.
    self.socket.listen(128).expect("socket is bound")
  }
}

//
// ListenerBinder
//

// Turns a listener flag into a bound socket. Tests inject pre-bound port-0 sockets through the
// mock so the node's addresses are known up front.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ListenerBinder: Send + Sync {
  async fn bind(&self, address: &str) -> anyhow::Result<BoundSocket>;
}

pub struct TcpListenerBinder {}

#[async_trait::async_trait]
impl ListenerBinder for TcpListenerBinder {
  async fn bind(&self, address: &str) -> anyhow::Result<BoundSocket> {
    BoundSocket::bind(address).await
  }
}
