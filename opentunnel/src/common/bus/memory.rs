// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;

use super::{request_via_inbox, Bus, BusError, BusMessage, Subscription};

type Subscribers = Vec<(u64, mpsc::UnboundedSender<BusMessage>)>;

/// An in-process bus, for single-process relays and tests
#[derive(Clone, Default)]
pub struct InMemoryBus {
  inner: Arc<InMemoryBusInner>,
}

#[derive(Default)]
struct InMemoryBusInner {
  subscribers: DashMap<String, Subscribers>,
  next_subscriber: AtomicU64,
}

impl InMemoryBusInner {
  fn unsubscribe(&self, subject: &str, subscriber: u64) {
    if let Some(mut subscribers) = self.subscribers.get_mut(subject) {
      subscribers.retain(|(id, _)| *id != subscriber);
    }
    self
      .subscribers
      .remove_if(subject, |_, subscribers| subscribers.is_empty());
  }
}

impl InMemoryBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of live subscriptions on a subject
  pub fn subscriber_count(&self, subject: &str) -> usize {
    self
      .inner
      .subscribers
      .get(subject)
      .map(|subscribers| subscribers.len())
      .unwrap_or(0)
  }

  fn deliver(&self, message: BusMessage) {
    // Senders are cloned out so no map guard is held while delivering
    let targets: Vec<_> = match self.inner.subscribers.get(&message.subject) {
      Some(subscribers) => subscribers.iter().map(|(_, sender)| sender.clone()).collect(),
      None => {
        tracing::trace!(subject = %message.subject, "Published to a subject with no subscribers");
        return;
      }
    };
    for target in targets {
      let _ = target.send(message.clone());
    }
  }
}

impl Bus for InMemoryBus {
  fn publish(&self, message: BusMessage) -> BoxFuture<'static, Result<(), BusError>> {
    let this = self.clone();
    async move {
      this.deliver(message);
      Ok(())
    }
    .boxed()
  }

  fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<Subscription, BusError>> {
    let inner = self.inner.clone();
    let subject = subject.to_string();
    async move {
      let id = inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
      let (sender, receiver) = mpsc::unbounded_channel();
      inner
        .subscribers
        .entry(subject.clone())
        .or_default()
        .push((id, sender));
      let weak = Arc::downgrade(&inner);
      let unsubscribe_subject = subject.clone();
      Ok(Subscription::new(subject, receiver, move || {
        if let Some(inner) = weak.upgrade() {
          inner.unsubscribe(&unsubscribe_subject, id);
        }
      }))
    }
    .boxed()
  }

  fn request(
    &self,
    subject: &str,
    payload: Vec<u8>,
    timeout: Duration,
  ) -> BoxFuture<'static, Result<BusMessage, BusError>> {
    request_via_inbox(self, subject, payload, timeout)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::StreamExt;

  use super::InMemoryBus;
  use crate::common::bus::{reply, Bus, BusError};

  #[tokio::test]
  async fn every_subscriber_receives_in_order() {
    let bus = InMemoryBus::new();
    let mut first = bus.subscribe("topic").await.unwrap();
    let mut second = bus.subscribe("topic").await.unwrap();
    for i in 0u8..3 {
      bus.publish_to("topic", vec![i]).await.unwrap();
    }
    for subscription in [&mut first, &mut second] {
      for i in 0u8..3 {
        assert_eq!(subscription.next().await.unwrap().payload, vec![i]);
      }
    }
  }

  #[tokio::test]
  async fn dropping_a_subscription_unsubscribes() {
    let bus = InMemoryBus::new();
    let subscription = bus.subscribe("topic").await.unwrap();
    let other = bus.subscribe("topic").await.unwrap();
    assert_eq!(bus.subscriber_count("topic"), 2);
    drop(subscription);
    assert_eq!(bus.subscriber_count("topic"), 1);
    drop(other);
    assert_eq!(bus.subscriber_count("topic"), 0);
    bus.publish_to("topic", b"nobody".to_vec()).await.unwrap();
  }

  #[tokio::test]
  async fn requests_receive_replies() {
    let bus = InMemoryBus::new();
    let mut service = bus.subscribe("echo").await.unwrap();
    let responder = {
      let bus = bus.clone();
      tokio::spawn(async move {
        let request = service.next().await.unwrap();
        reply(&bus, &request, request.payload.clone())
          .expect("Requests carry a reply subject")
          .await
          .unwrap();
      })
    };
    let answer = bus
      .request("echo", b"ping".to_vec(), Duration::from_secs(5))
      .await
      .unwrap();
    assert_eq!(answer.payload, b"ping");
    responder.await.unwrap();
    assert!(
      bus.inner.subscribers.is_empty(),
      "Inbox and service subscriptions must both be released"
    );
  }

  #[tokio::test(start_paused = true)]
  async fn unanswered_requests_time_out() {
    let bus = InMemoryBus::new();
    let result = bus
      .request("void", Vec::new(), Duration::from_secs(5))
      .await;
    assert!(matches!(result, Err(BusError::Timeout { .. })));
  }
}
