// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Helpers for `select!` loops over work that may or may not be in flight
//!
//! Each helper stays pending while its slot is empty, so a branch can be
//! polled unconditionally and simply never fire until something is placed
//! in the slot.

use futures::{
  future::{self, BoxFuture},
  Stream, StreamExt,
};
use tokio::time::Instant;

/// Drives the future in `slot` to completion, emptying the slot
pub async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
  match slot {
    Some(work) => {
      let output = work.await;
      *slot = None;
      output
    }
    None => future::pending().await,
  }
}

/// Next item of the stream in `slot`; `None` once the stream has ended
pub async fn next_in<S: Stream + Unpin>(slot: &mut Option<S>) -> Option<S::Item> {
  match slot {
    Some(stream) => stream.next().await,
    None => future::pending().await,
  }
}

pub async fn sleep_until_opt(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => future::pending().await,
  }
}
