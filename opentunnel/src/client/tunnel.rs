// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Keeps a client session connected to the relay, reconnecting forever with jitter

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
  net::TcpStream,
  sync::broadcast::{channel as event_channel, Receiver, Sender as Broadcaster},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::session::{ClientSession, ClientSessionConfig, WellKnownResolver};
use crate::{
  common::lifecycle::{Lifecycle, TunnelState},
  util::{
    dropkick::Dropkick,
    framed::{FramedTransport, DEFAULT_MAX_FRAME_LENGTH},
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelEvent {
  Connected,
  Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientTunnelConfig {
  /// Relay backend address, as `host:port`
  pub server: String,
  pub token: Vec<u8>,
  pub session: ClientSessionConfig,
  pub connect_timeout: Duration,
  pub reconnect_min: Duration,
  pub reconnect_max: Duration,
  pub max_frame_length: Option<usize>,
}

impl ClientTunnelConfig {
  pub fn new(server: impl Into<String>, token: Vec<u8>, session: ClientSessionConfig) -> Self {
    Self {
      server: server.into(),
      token,
      session,
      connect_timeout: Duration::from_secs(10),
      reconnect_min: Duration::from_millis(1000),
      reconnect_max: Duration::from_millis(6000),
      max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
    }
  }

  fn reconnect_delay(&self) -> Duration {
    let min = self.reconnect_min.as_millis() as u64;
    let max = (self.reconnect_max.as_millis() as u64).max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
  }
}

pub struct ClientTunnel {
  config: ClientTunnelConfig,
  resolver: Arc<dyn WellKnownResolver>,
  events: Broadcaster<TunnelEvent>,
}

/// A running tunnel; dropping it stops the tunnel
pub struct ClientTunnelHandle {
  events: Broadcaster<TunnelEvent>,
  stop: Dropkick<CancellationToken>,
  task: JoinHandle<()>,
}

impl ClientTunnelHandle {
  pub fn events(&self) -> Receiver<TunnelEvent> {
    self.events.subscribe()
  }

  pub fn is_running(&self) -> bool {
    !self.task.is_finished()
  }

  pub async fn stop(self) {
    let ClientTunnelHandle { stop, task, .. } = self;
    stop.kick();
    let _ = task.await;
  }
}

impl ClientTunnel {
  pub fn new(config: ClientTunnelConfig, resolver: Arc<dyn WellKnownResolver>) -> Self {
    let (events, _) = event_channel(16);
    Self {
      config,
      resolver,
      events,
    }
  }

  /// Subscribe before [ClientTunnel::start] to observe the first connection
  pub fn events(&self) -> Receiver<TunnelEvent> {
    self.events.subscribe()
  }

  pub fn start(self) -> ClientTunnelHandle {
    let stop = CancellationToken::new();
    let events = self.events.clone();
    let span = tracing::info_span!("client_tunnel", role = "client", server = %self.config.server);
    let task = tokio::task::spawn(self.run(stop.clone()).instrument(span));
    ClientTunnelHandle {
      events,
      stop: Dropkick::new(stop),
      task,
    }
  }

  async fn run(self, stop: CancellationToken) {
    let ClientTunnel {
      config,
      resolver,
      events,
    } = self;
    let mut lifecycle = Lifecycle::new(TunnelState::Connecting);
    loop {
      if !lifecycle.is(TunnelState::Connecting) {
        lifecycle.enter(TunnelState::Connecting);
      }
      tracing::debug!("Connecting to relay");
      let connected = tokio::select! {
        biased;
        _ = stop.cancelled() => break,
        connected = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.server)) => connected,
      };
      match connected {
        Ok(Ok(stream)) => {
          let _ = stream.set_nodelay(true);
          lifecycle.enter(TunnelState::Connected);
          tracing::info!("Relay link established");
          let _ = events.send(TunnelEvent::Connected);
          let session = ClientSession::new(
            FramedTransport::new(stream, config.max_frame_length),
            config.token.clone(),
            config.session,
            resolver.clone(),
          );
          let session_handle = session.handle();
          let mut running = session.start();
          let end = tokio::select! {
            biased;
            _ = stop.cancelled() => {
              session_handle.stop();
              let _ = (&mut running).await;
              None
            }
            end = &mut running => end.ok(),
          };
          let _ = events.send(TunnelEvent::Disconnected);
          if stop.is_cancelled() {
            break;
          }
          tracing::info!(?end, "Relay link lost");
        }
        Ok(Err(error)) => tracing::warn!(%error, "Failed to reach relay"),
        Err(_elapsed) => tracing::warn!(timeout = ?config.connect_timeout, "Timed out reaching relay"),
      }
      lifecycle.enter(TunnelState::Waiting);
      let delay = config.reconnect_delay();
      tracing::debug!(?delay, "Reconnecting after delay");
      tokio::select! {
        biased;
        _ = stop.cancelled() => break,
        _ = tokio::time::sleep(delay) => (),
      }
    }
    lifecycle.enter(TunnelState::Stopped);
    tracing::info!("Client tunnel stopped");
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use futures::FutureExt;
  use tokio::net::TcpListener;

  use super::{ClientTunnel, ClientTunnelConfig, TunnelEvent};
  use crate::{
    client::session::{ClientSessionConfig, MockWellKnownResolver},
    common::protocol::ClientHandshake,
    util::framed::FramedTransport,
  };

  fn config(server: String) -> ClientTunnelConfig {
    let mut config = ClientTunnelConfig::new(
      server,
      b"token".to_vec(),
      ClientSessionConfig::new("127.0.0.1:9".parse().unwrap()),
    );
    config.reconnect_min = Duration::from_millis(10);
    config.reconnect_max = Duration::from_millis(20);
    config
  }

  fn resolver() -> Arc<MockWellKnownResolver> {
    let mut resolver = MockWellKnownResolver::new();
    resolver.expect_resolve().returning(|_| async { None }.boxed());
    Arc::new(resolver)
  }

  async fn next_event(events: &mut tokio::sync::broadcast::Receiver<TunnelEvent>) -> TunnelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .expect("Event must arrive")
      .unwrap()
  }

  #[test]
  fn reconnect_delays_stay_within_the_jitter_window() {
    let config = ClientTunnelConfig::new("relay:9001", Vec::new(), ClientSessionConfig::new("127.0.0.1:9".parse().unwrap()));
    for _ in 0..100 {
      let delay = config.reconnect_delay();
      assert!(delay >= Duration::from_millis(1000) && delay <= Duration::from_millis(6000));
    }
  }

  #[tokio::test]
  async fn reconnects_after_losing_the_relay() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel = ClientTunnel::new(config(relay.local_addr().unwrap().to_string()), resolver());
    let mut events = tunnel.events();
    let tunnel = tunnel.start();

    let (first, _) = relay.accept().await.unwrap();
    let mut first = FramedTransport::new(first, None);
    let handshake = first.next_frame().await.unwrap().unwrap();
    assert_eq!(ClientHandshake::decode(&handshake).unwrap().token, b"token");
    assert_eq!(next_event(&mut events).await, TunnelEvent::Connected);

    first.close();
    assert_eq!(next_event(&mut events).await, TunnelEvent::Disconnected);
    let (second, _) = tokio::time::timeout(Duration::from_secs(5), relay.accept())
      .await
      .expect("Tunnel must reconnect")
      .unwrap();
    let mut second = FramedTransport::new(second, None);
    assert!(second.next_frame().await.unwrap().is_ok());
    assert_eq!(next_event(&mut events).await, TunnelEvent::Connected);

    tunnel.stop().await;
    assert_eq!(next_event(&mut events).await, TunnelEvent::Disconnected);
    assert!(second.next_frame().await.is_none(), "Stopping closes the link");
  }

  #[tokio::test]
  async fn keeps_retrying_an_absent_relay() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = relay.local_addr().unwrap();
    drop(relay);
    let tunnel = ClientTunnel::new(config(address.to_string()), resolver()).start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tunnel.is_running());

    let relay = TcpListener::bind(address).await.unwrap();
    let (link, _) = tokio::time::timeout(Duration::from_secs(5), relay.accept())
      .await
      .expect("Tunnel must connect once the relay appears")
      .unwrap();
    drop(link);
    tunnel.stop().await;
  }
}
