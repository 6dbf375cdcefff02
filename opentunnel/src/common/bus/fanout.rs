// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Local fan-out of one remote channel subscription per subject
//!
//! Remote SUBSCRIBE and UNSUBSCRIBE commands for a subject are issued one at a
//! time under a per-subject lock, and an UNSUBSCRIBE is skipped when a new
//! local subscriber arrived while it was queued.

use std::{
  future::Future,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, Mutex};

use super::{BusError, BusMessage, Subscription};

/// Channel membership on the remote broker
pub trait RemoteSubscriptions: Send + Sync + 'static {
  fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<(), BusError>>;

  fn unsubscribe(&self, subject: &str) -> BoxFuture<'static, Result<(), BusError>>;
}

type Subscribers = Vec<(u64, mpsc::UnboundedSender<BusMessage>)>;

pub struct SubscriptionTable<R> {
  remote: R,
  local: DashMap<String, Subscribers>,
  locks: DashMap<String, Arc<Mutex<()>>>,
  next_subscriber: AtomicU64,
}

impl<R: RemoteSubscriptions> SubscriptionTable<R> {
  pub fn new(remote: R) -> Arc<Self> {
    Arc::new(Self {
      remote,
      local: DashMap::new(),
      locks: DashMap::new(),
      next_subscriber: AtomicU64::new(0),
    })
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  /// Resolves once the remote broker has confirmed the channel
  ///
  /// Concurrent subscribers of a new subject all wait for the first one's SUBSCRIBE.
  pub fn subscribe(self: &Arc<Self>, subject: &str) -> BoxFuture<'static, Result<Subscription, BusError>> {
    let table = self.clone();
    let subject = subject.to_string();
    async move {
      let work = async {
        let id = table.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let first = {
          let mut subscribers = table.local.entry(subject.clone()).or_default();
          subscribers.push((id, sender));
          subscribers.len() == 1
        };
        // Dropped on failure or cancellation, which releases the local entry
        let weak = Arc::downgrade(&table);
        let release_subject = subject.clone();
        let subscription = Subscription::new(subject.clone(), receiver, move || {
          if let Some(table) = weak.upgrade() {
            table.release(&release_subject, id);
          }
        });
        if first {
          table.remote.subscribe(&subject).await?;
        }
        Ok::<_, BusError>(subscription)
      };
      table.serialized(&subject, work).await
    }
    .boxed()
  }

  /// Hands a received message to every local subscriber of its subject
  pub fn deliver(&self, message: &BusMessage) -> usize {
    let targets: Vec<_> = match self.local.get(&message.subject) {
      Some(subscribers) => subscribers.iter().map(|(_, sender)| sender.clone()).collect(),
      None => return 0,
    };
    targets
      .into_iter()
      .filter(|target| target.send(message.clone()).is_ok())
      .count()
  }

  /// Re-issues SUBSCRIBE for every subject with local subscribers, as after a broker reconnect
  pub async fn resubscribe_all(&self) {
    let subjects: Vec<String> = self.local.iter().map(|entry| entry.key().clone()).collect();
    tracing::debug!(subjects = subjects.len(), "Restoring remote subscriptions");
    for subject in subjects {
      let work = async {
        if !self.local.contains_key(&subject) {
          return;
        }
        if let Err(error) = self.remote.subscribe(&subject).await {
          tracing::warn!(%subject, %error, "Failed to restore a remote subscription");
        }
      };
      self.serialized(&subject, work).await;
    }
  }

  fn release(self: &Arc<Self>, subject: &str, subscriber: u64) {
    if !self.forget(subject, subscriber) {
      return;
    }
    let runtime = match tokio::runtime::Handle::try_current() {
      Ok(runtime) => runtime,
      Err(_) => return,
    };
    let table = self.clone();
    let subject = subject.to_string();
    runtime.spawn(async move {
      let work = async {
        if table.local.contains_key(&subject) {
          tracing::trace!(%subject, "Subject was resubscribed before its release; keeping the channel");
          return;
        }
        if let Err(error) = table.remote.unsubscribe(&subject).await {
          tracing::debug!(%subject, %error, "Remote unsubscribe failed");
        }
      };
      table.serialized(&subject, work).await;
    });
  }

  /// Removes a local subscriber, returning whether its subject has none left
  fn forget(&self, subject: &str, subscriber: u64) -> bool {
    if let Some(mut subscribers) = self.local.get_mut(subject) {
      subscribers.retain(|(id, _)| *id != subscriber);
    }
    self
      .local
      .remove_if(subject, |_, subscribers| subscribers.is_empty())
      .is_some()
  }

  async fn serialized<T>(&self, subject: &str, work: impl Future<Output = T>) -> T {
    let lock = self.locks.entry(subject.to_string()).or_default().clone();
    let result = {
      let _held = lock.lock().await;
      work.await
    };
    drop(lock);
    self.locks.remove_if(subject, |_, lock| Arc::strong_count(lock) == 1);
    result
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::HashSet,
    sync::{
      atomic::{AtomicBool, AtomicUsize, Ordering},
      Arc, Mutex,
    },
    time::Duration,
  };

  use futures::{
    future::{BoxFuture, FutureExt},
    StreamExt,
  };

  use super::{RemoteSubscriptions, SubscriptionTable};
  use crate::common::bus::{BusError, BusMessage};

  #[derive(Default)]
  struct BrokerState {
    active: Mutex<HashSet<String>>,
    subscribes: AtomicUsize,
    failing: AtomicBool,
  }

  /// A broker whose UNSUBSCRIBE is slower than its SUBSCRIBE
  #[derive(Clone, Default)]
  struct FakeBroker {
    state: Arc<BrokerState>,
  }

  impl FakeBroker {
    fn is_active(&self, subject: &str) -> bool {
      self.state.active.lock().unwrap().contains(subject)
    }

    fn subscribes(&self) -> usize {
      self.state.subscribes.load(Ordering::SeqCst)
    }

    fn reset(&self) {
      self.state.active.lock().unwrap().clear();
    }
  }

  impl RemoteSubscriptions for FakeBroker {
    fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<(), BusError>> {
      let state = self.state.clone();
      let subject = subject.to_string();
      async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if state.failing.load(Ordering::SeqCst) {
          return Err(BusError::Transport("broker unavailable".into()));
        }
        state.subscribes.fetch_add(1, Ordering::SeqCst);
        state.active.lock().unwrap().insert(subject);
        Ok(())
      }
      .boxed()
    }

    fn unsubscribe(&self, subject: &str) -> BoxFuture<'static, Result<(), BusError>> {
      let state = self.state.clone();
      let subject = subject.to_string();
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.active.lock().unwrap().remove(&subject);
        Ok(())
      }
      .boxed()
    }
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn resubscribing_after_a_release_keeps_the_channel() {
    let table = SubscriptionTable::new(FakeBroker::default());
    let first = table.subscribe("s").await.unwrap();
    drop(first);
    let mut second = table.subscribe("s").await.unwrap();
    settle().await;
    assert!(
      table.remote().is_active("s"),
      "A queued unsubscribe must not remove a channel with live subscribers"
    );
    assert_eq!(table.deliver(&BusMessage::new("s", b"hello".to_vec())), 1);
    assert_eq!(second.next().await.unwrap().payload, b"hello");
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_subscribers_wait_for_the_channel() {
    let table = SubscriptionTable::new(FakeBroker::default());
    let broker = table.remote().clone();
    let subscribed = futures::future::join_all((0..3).map(|_| {
      let broker = broker.clone();
      table.subscribe("s").map(move |subscribed| {
        assert!(broker.is_active("s"), "Subscribers must not resolve before the channel exists");
        subscribed
      })
    }))
    .await;
    assert!(subscribed.iter().all(Result::is_ok));
    assert_eq!(broker.subscribes(), 1, "Only the first subscriber issues a SUBSCRIBE");
    assert_eq!(table.deliver(&BusMessage::new("s", Vec::new())), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn resubscribe_all_restores_held_subjects() {
    let table = SubscriptionTable::new(FakeBroker::default());
    let _held = table.subscribe("held").await.unwrap();
    drop(table.subscribe("dropped").await.unwrap());
    settle().await;
    table.remote().reset();
    table.resubscribe_all().await;
    assert!(table.remote().is_active("held"));
    assert!(!table.remote().is_active("dropped"));
  }

  #[tokio::test(start_paused = true)]
  async fn failed_subscribes_leave_no_local_subscriber() {
    let table = SubscriptionTable::new(FakeBroker::default());
    table.remote().state.failing.store(true, Ordering::SeqCst);
    assert!(matches!(table.subscribe("s").await, Err(BusError::Transport(_))));
    assert_eq!(table.deliver(&BusMessage::new("s", Vec::new())), 0);

    table.remote().state.failing.store(false, Ordering::SeqCst);
    let _subscription = table.subscribe("s").await.unwrap();
    settle().await;
    assert!(table.remote().is_active("s"));
  }
}
