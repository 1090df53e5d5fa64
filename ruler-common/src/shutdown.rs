// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./shutdown_test.rs"]
mod shutdown_test;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

//
// ComponentShutdown
//

// Handle held by a running component. The component selects on cancelled() to learn about
// shutdown, and the trigger's shutdown() call does not complete until every outstanding handle
// has been dropped.
#[derive(Clone)]
pub struct ComponentShutdown {
  token: CancellationToken,
  _guard: mpsc::Sender<()>,
}

impl ComponentShutdown {
  pub async fn cancelled(&self) {
    self.token.cancelled().await;
  }

  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }
}

//
// ComponentShutdownTriggerHandle
//

// Clonable handle used to mint new component shutdowns after the trigger has been moved into
// the supervisor.
#[derive(Clone)]
pub struct ComponentShutdownTriggerHandle {
  token: CancellationToken,
  tx: mpsc::Sender<()>,
}

impl ComponentShutdownTriggerHandle {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      token: self.token.clone(),
      _guard: self.tx.clone(),
    }
  }
}

//
// ComponentShutdownTrigger
//

pub struct ComponentShutdownTrigger {
  token: CancellationToken,
  tx: mpsc::Sender<()>,
  rx: mpsc::Receiver<()>,
}

impl Default for ComponentShutdownTrigger {
  fn default() -> Self {
    let (tx, rx) = mpsc::channel(1);
    Self {
      token: CancellationToken::new(),
      tx,
      rx,
    }
  }
}

impl ComponentShutdownTrigger {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      token: self.token.clone(),
      _guard: self.tx.clone(),
    }
  }

  #[must_use]
  pub fn make_handle(&self) -> ComponentShutdownTriggerHandle {
    ComponentShutdownTriggerHandle {
      token: self.token.clone(),
      tx: self.tx.clone(),
    }
  }

  // Cancel all components and wait for every handle to drop.
  pub async fn shutdown(mut self) {
    self.token.cancel();
    drop(self.tx);
    // recv() yields None once the last guard is gone. No sends ever happen on this channel.
    let _ = self.rx.recv().await;
  }
}
