// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Aliveness tracking by silence window
//!
//! A key stays present while it keeps being declared; once a full window
//! passes without a declaration it is evicted exactly once. There is no
//! explicit leave; re-declaring an evicted key is simply a new sighting.

use std::{collections::HashMap, hash::Hash, time::Duration};

use futures::StreamExt;
use tokio_util::time::{delay_queue, DelayQueue};

pub const DEFAULT_PRESENCE_WINDOW: Duration = Duration::from_millis(5000);

pub struct PresenceTracker<K> {
  window: Duration,
  entries: HashMap<K, delay_queue::Key>,
  expirations: DelayQueue<K>,
}

impl<K> Default for PresenceTracker<K>
where
  K: Clone + Eq + Hash,
{
  fn default() -> Self {
    Self::new(DEFAULT_PRESENCE_WINDOW)
  }
}

impl<K> PresenceTracker<K>
where
  K: Clone + Eq + Hash,
{
  pub fn new(window: Duration) -> Self {
    Self {
      window,
      entries: HashMap::new(),
      expirations: DelayQueue::new(),
    }
  }

  pub fn window(&self) -> Duration {
    self.window
  }

  /// Resets the key's expiry to a full window from now; returns whether this is a new sighting
  pub fn declare_alive(&mut self, key: K) -> bool {
    match self.entries.get(&key) {
      Some(expiry) => {
        self.expirations.reset(expiry, self.window);
        false
      }
      None => {
        let expiry = self.expirations.insert(key.clone(), self.window);
        self.entries.insert(key, expiry);
        true
      }
    }
  }

  pub fn contains(&self, key: &K) -> bool {
    self.entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &K> {
    self.entries.keys()
  }

  /// Waits for the next key to fall silent and removes it
  ///
  /// Never resolves while nothing is tracked. Cancel-safe, so it may be
  /// polled from a `select!` loop alongside [PresenceTracker::declare_alive].
  pub async fn next_eviction(&mut self) -> K {
    loop {
      if self.expirations.is_empty() {
        futures::future::pending::<()>().await;
      }
      if let Some(expired) = self.expirations.next().await {
        let key = expired.into_inner();
        self.entries.remove(&key);
        return key;
      }
    }
  }
}
