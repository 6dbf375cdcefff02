// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A process shutdown signal that cannot be triggered by its recipient
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct ShutdownListener {
  token: CancellationToken,
}

impl ShutdownListener {
  /// A listener fired by the first SIGINT; the returned task should be aborted on normal exit
  pub fn on_ctrl_c() -> (Self, JoinHandle<()>) {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      trigger.cancel();
    });
    (Self { token }, task)
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for ShutdownListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}
