// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Peer discovery by heartbeat on the shared `nodes` subject

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast::{channel as event_channel, error::RecvError, Receiver, Sender as Broadcaster};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  bus::{subjects, ArcBus, BusError, Subscription},
  presence::{PresenceTracker, DEFAULT_PRESENCE_WINDOW},
  session_id::SessionId,
};
use crate::util::dropkick::Dropkick;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
  Connected(String),
  Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTrackerConfig {
  pub heartbeat_interval: Duration,
  pub presence_window: Duration,
}

impl Default for NodeTrackerConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_millis(1000),
      presence_window: DEFAULT_PRESENCE_WINDOW,
    }
  }
}

/// Announces this node and tracks its peers until dropped
pub struct NodeTracker {
  node_id: SessionId,
  events: Broadcaster<NodeEvent>,
  _shutdown: Dropkick<CancellationToken>,
}

impl NodeTracker {
  /// Subscribes to peer heartbeats, then starts announcing this node immediately and once per interval
  pub async fn start(node_id: SessionId, bus: ArcBus, config: NodeTrackerConfig) -> Result<Self, BusError> {
    let heartbeats = bus.subscribe(subjects::NODES).await?;
    let (events, _) = event_channel(64);
    let shutdown = CancellationToken::new();
    let span = tracing::info_span!("node_tracker", node = %node_id);
    tokio::task::spawn(
      Self::run(
        node_id.clone(),
        bus,
        config,
        heartbeats,
        events.clone(),
        shutdown.clone(),
      )
      .instrument(span),
    );
    Ok(Self {
      node_id,
      events,
      _shutdown: Dropkick::new(shutdown),
    })
  }

  pub fn node_id(&self) -> &SessionId {
    &self.node_id
  }

  pub fn events(&self) -> Receiver<NodeEvent> {
    self.events.subscribe()
  }

  async fn run(
    node_id: SessionId,
    bus: ArcBus,
    config: NodeTrackerConfig,
    mut heartbeats: Subscription,
    events: Broadcaster<NodeEvent>,
    shutdown: CancellationToken,
  ) {
    let mut peers = PresenceTracker::<String>::new(config.presence_window);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = heartbeat.tick() => {
          if let Err(error) = bus.publish_to(subjects::NODES, node_id.as_str().as_bytes().to_vec()).await {
            tracing::warn!(%error, "Failed to publish node heartbeat");
          }
        }
        message = heartbeats.next() => {
          let message = match message {
            Some(message) => message,
            None => {
              tracing::warn!("Node heartbeat subscription ended");
              break;
            }
          };
          let peer = match std::str::from_utf8(&message.payload) {
            Ok(peer) if peer.is_ascii() && !peer.is_empty() => peer,
            _ => {
              tracing::debug!("Discarding malformed node heartbeat");
              continue;
            }
          };
          if peer == node_id.as_str() {
            continue;
          }
          if peers.declare_alive(peer.to_string()) {
            tracing::info!(peer, "Node connected");
            let _ = events.send(NodeEvent::Connected(peer.to_string()));
          }
        }
        peer = peers.next_eviction() => {
          tracing::info!(%peer, "Node disconnected");
          let _ = events.send(NodeEvent::Disconnected(peer));
        }
      }
    }
    tracing::debug!("Node tracker stopped");
  }
}

/// Logs peer arrivals and departures until the tracker is dropped
pub async fn log_node_events(mut events: Receiver<NodeEvent>) {
  loop {
    match events.recv().await {
      Ok(NodeEvent::Connected(node)) => tracing::info!(%node, "Peer node connected"),
      Ok(NodeEvent::Disconnected(node)) => tracing::info!(%node, "Peer node disconnected"),
      Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Missed node events"),
      Err(RecvError::Closed) => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use futures::StreamExt;

  use super::{NodeEvent, NodeTracker, NodeTrackerConfig};
  use crate::common::{
    bus::{subjects, Bus, InMemoryBus},
    session_id::SessionId,
  };

  #[tokio::test(start_paused = true)]
  async fn peers_connect_and_disconnect() {
    let bus = InMemoryBus::new();
    let first = NodeTracker::start(SessionId::new(), Arc::new(bus.clone()), NodeTrackerConfig::default())
      .await
      .unwrap();
    let mut events = first.events();
    let second_id = SessionId::new();
    let second = NodeTracker::start(second_id.clone(), Arc::new(bus.clone()), NodeTrackerConfig::default())
      .await
      .unwrap();

    assert_eq!(
      events.recv().await.unwrap(),
      NodeEvent::Connected(second_id.to_string())
    );
    // Stays connected while heartbeats continue
    let quiet = tokio::time::timeout(Duration::from_secs(20), events.recv()).await;
    assert!(quiet.is_err(), "No events are expected while the peer keeps beating");

    drop(second);
    let started = tokio::time::Instant::now();
    assert_eq!(
      events.recv().await.unwrap(),
      NodeEvent::Disconnected(second_id.to_string())
    );
    assert!(started.elapsed() <= Duration::from_secs(6));
  }

  #[tokio::test(start_paused = true)]
  async fn own_heartbeats_are_ignored_and_published_promptly() {
    let bus = InMemoryBus::new();
    let mut observer = bus.subscribe(subjects::NODES).await.unwrap();
    let id = SessionId::new();
    let tracker = NodeTracker::start(id.clone(), Arc::new(bus.clone()), NodeTrackerConfig::default())
      .await
      .unwrap();
    let mut events = tracker.events();
    let first = tokio::time::timeout(Duration::from_millis(10), observer.next())
      .await
      .expect("First heartbeat must be immediate")
      .unwrap();
    assert_eq!(first.payload, id.as_str().as_bytes());
    let nothing = tokio::time::timeout(Duration::from_secs(10), events.recv()).await;
    assert!(nothing.is_err());
  }
}
