// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Publish/subscribe substrate connecting frontends and backends
//!
//! Delivery is at-most-once with no ordering across publishers; a subscriber
//! sees a single publisher's messages in publication order. Request/reply is
//! built atop publish and subscribe with a unique inbox subject.

use std::{
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
  time::Duration,
};

use futures::{
  future::{BoxFuture, FutureExt},
  Stream, StreamExt,
};
use tokio::sync::mpsc;

use crate::util::dropkick::Dropkick;

pub mod fanout;
pub mod memory;
#[cfg(feature = "redis-bus")]
pub mod redis;
pub mod subjects;

pub use memory::InMemoryBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
  pub subject: String,
  pub payload: Vec<u8>,
  /// Subject on which the publisher awaits an answer
  pub reply_to: Option<String>,
}

impl BusMessage {
  pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
    Self {
      subject: subject.into(),
      payload,
      reply_to: None,
    }
  }

  pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
    self.reply_to = Some(reply_to.into());
    self
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
  #[error("Request on {subject} received no reply within {timeout:?}")]
  Timeout { subject: String, timeout: Duration },
  #[error("Bus connection is closed")]
  Closed,
  #[error("Bus transport failure: {0}")]
  Transport(String),
}

/// Implementations do no work until the returned futures are polled
pub trait Bus: Send + Sync + 'static {
  fn publish(&self, message: BusMessage) -> BoxFuture<'static, Result<(), BusError>>;

  /// Resolves once the subscription is active on the bus
  fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<Subscription, BusError>>;

  /// Publishes `payload` and waits for the first reply; never retried here
  fn request(
    &self,
    subject: &str,
    payload: Vec<u8>,
    timeout: Duration,
  ) -> BoxFuture<'static, Result<BusMessage, BusError>>;

  fn publish_to(&self, subject: &str, payload: Vec<u8>) -> BoxFuture<'static, Result<(), BusError>> {
    self.publish(BusMessage::new(subject, payload))
  }
}

pub type ArcBus = Arc<dyn Bus>;

/// A live subscription; dropping it unsubscribes
pub struct Subscription {
  subject: String,
  receiver: mpsc::UnboundedReceiver<BusMessage>,
  _unsubscribe: Dropkick<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("subject", &self.subject)
      .finish_non_exhaustive()
  }
}

impl Subscription {
  pub fn new(
    subject: impl Into<String>,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    unsubscribe: impl FnOnce() + Send + Sync + 'static,
  ) -> Self {
    let unsubscribe: Box<dyn FnOnce() + Send + Sync> = Box::new(unsubscribe);
    Self {
      subject: subject.into(),
      receiver,
      _unsubscribe: Dropkick::new(unsubscribe),
    }
  }

  pub fn subject(&self) -> &str {
    &self.subject
  }
}

impl Stream for Subscription {
  type Item = BusMessage;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.receiver.poll_recv(cx)
  }
}

/// Request/reply over plain publish and subscribe through a one-off inbox subject
pub fn request_via_inbox<B>(
  bus: &B,
  subject: &str,
  payload: Vec<u8>,
  timeout: Duration,
) -> BoxFuture<'static, Result<BusMessage, BusError>>
where
  B: Bus + ?Sized,
{
  let inbox = subjects::inbox();
  let subscribing = bus.subscribe(&inbox);
  let message = BusMessage::new(subject, payload).with_reply_to(inbox);
  let publish = bus.publish(message);
  let subject = subject.to_string();
  async move {
    let mut replies = subscribing.await?;
    publish.await?;
    match tokio::time::timeout(timeout, replies.next()).await {
      Ok(Some(reply)) => Ok(reply),
      Ok(None) => Err(BusError::Closed),
      Err(_elapsed) => Err(BusError::Timeout { subject, timeout }),
    }
  }
  .boxed()
}

/// Answers a request, if the message carried a reply subject
pub fn reply<B>(bus: &B, request: &BusMessage, payload: Vec<u8>) -> Option<BoxFuture<'static, Result<(), BusError>>>
where
  B: Bus + ?Sized,
{
  request
    .reply_to
    .as_deref()
    .map(|reply_to| bus.publish_to(reply_to, payload))
}
