// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The client's end of its physical link to the relay

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures::{
  future::{BoxFuture, FutureExt},
  stream::FuturesUnordered,
  StreamExt,
};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::connection::{ClientConnection, ClientConnectionHandle};
use crate::{
  common::{
    protocol::{ClientHandshake, ClientMessage},
    session_id::SessionId,
  },
  util::{
    dropkick::Dropkick,
    framed::{writer_ended, FrameSender, FramedTransport},
  },
};

/// Answers `/.well-known` requests relayed from the public edge
#[cfg_attr(test, mockall::automock)]
pub trait WellKnownResolver: Send + Sync {
  /// `path` excludes the `/.well-known` prefix; `None` when there is nothing to serve
  fn resolve(&self, path: &str) -> BoxFuture<'static, Option<Vec<u8>>>;
}

/// Fetches well-known content from a plain-HTTP server on the local machine
#[derive(Debug, Clone)]
pub struct HttpWellKnownResolver {
  client: reqwest::Client,
  port: u16,
}

impl HttpWellKnownResolver {
  /// Lookups slower than the relay's own well-known expiry are pointless
  pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

  pub fn new(port: u16) -> Self {
    Self::with_timeout(port, Self::DEFAULT_TIMEOUT)
  }

  pub fn with_timeout(port: u16, timeout: Duration) -> Self {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .unwrap_or_default();
    Self { client, port }
  }

  pub fn url_for(&self, path: &str) -> String {
    format!("http://localhost:{}/.well-known{}", self.port, path)
  }
}

impl WellKnownResolver for HttpWellKnownResolver {
  fn resolve(&self, path: &str) -> BoxFuture<'static, Option<Vec<u8>>> {
    let request = self.client.get(self.url_for(path));
    async move {
      let response = match request.send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
          tracing::debug!(status = %response.status(), "Local well-known lookup missed");
          return None;
        }
        Err(error) => {
          tracing::debug!(%error, "Local well-known lookup failed");
          return None;
        }
      };
      response.bytes().await.ok().map(|body| body.to_vec())
    }
    .boxed()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSessionConfig {
  /// Local service that tunneled connections are bridged to
  pub target: SocketAddr,
  pub keepalive_interval: Duration,
}

impl ClientSessionConfig {
  pub fn new(target: SocketAddr) -> Self {
    Self {
      target,
      keepalive_interval: Duration::from_secs(15),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEnd {
  Requested,
  TransportClosed,
  TransportError,
}

#[derive(Debug, Clone)]
pub struct ClientSessionHandle {
  stop: CancellationToken,
  stopped: CancellationToken,
}

impl ClientSessionHandle {
  pub fn stop(&self) {
    self.stop.cancel();
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.is_cancelled()
  }

  pub async fn stopped(&self) {
    self.stopped.cancelled().await
  }
}

pub struct ClientSession {
  id: SessionId,
  transport: FramedTransport,
  token: Vec<u8>,
  config: ClientSessionConfig,
  resolver: Arc<dyn WellKnownResolver>,
  stop: CancellationToken,
  stopped: CancellationToken,
}

type PendingResponse = BoxFuture<'static, ClientMessage>;

fn send(sender: &FrameSender, message: &ClientMessage) {
  match message.encode() {
    Ok(frame) => {
      let _ = sender.send(frame);
    }
    Err(error) => tracing::warn!(%error, "Failed to encode client message"),
  }
}

impl ClientSession {
  pub fn new(
    transport: FramedTransport,
    token: Vec<u8>,
    config: ClientSessionConfig,
    resolver: Arc<dyn WellKnownResolver>,
  ) -> Self {
    Self {
      id: SessionId::new(),
      transport,
      token,
      config,
      resolver,
      stop: CancellationToken::new(),
      stopped: CancellationToken::new(),
    }
  }

  pub fn handle(&self) -> ClientSessionHandle {
    ClientSessionHandle {
      stop: self.stop.clone(),
      stopped: self.stopped.clone(),
    }
  }

  /// Sends the handshake and serves the link until it closes or the session is stopped
  pub fn start(self) -> JoinHandle<SessionEnd> {
    let span = tracing::info_span!("client_session", role = "client", id = %self.id);
    tokio::task::spawn(self.run().instrument(span))
  }

  async fn run(self) -> SessionEnd {
    let ClientSession {
      id: _,
      transport,
      token,
      config,
      resolver,
      stop,
      stopped,
    } = self;
    let _stopped = Dropkick::new(stopped);
    let (mut incoming, sender, writer) = transport.into_parts();
    let mut writer = Some(writer);
    match (ClientHandshake { token }).encode() {
      Ok(handshake) => {
        let _ = sender.send(handshake);
      }
      Err(error) => {
        tracing::warn!(%error, "Access token cannot be sent");
        return SessionEnd::TransportError;
      }
    }

    let mut connections: HashMap<String, ClientConnectionHandle> = HashMap::new();
    let (closed_sender, mut closed) = mpsc::unbounded_channel::<String>();
    let mut responses: FuturesUnordered<PendingResponse> = FuturesUnordered::new();
    let mut keepalive = tokio::time::interval_at(
      tokio::time::Instant::now() + config.keepalive_interval,
      config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("Client session started");

    let end = loop {
      tokio::select! {
        biased;
        _ = stop.cancelled() => break SessionEnd::Requested,
        _ = writer_ended(&mut writer) => break SessionEnd::TransportError,
        frame = incoming.next() => {
          let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
              tracing::info!(%error, "Relay link failed");
              break SessionEnd::TransportError;
            }
            None => break SessionEnd::TransportClosed,
          };
          let message = match ClientMessage::decode(&frame) {
            Ok(message) => message,
            Err(error) => {
              tracing::debug!(%error, "Discarding malformed relay message");
              continue;
            }
          };
          match message {
            ClientMessage::Connected { id } => {
              if connections.contains_key(&id) {
                tracing::trace!(connection = %id, "Ignoring repeated connect");
                continue;
              }
              tracing::info!(connection = %id, "New tunneled connection");
              let connection = ClientConnection::new(id.clone(), config.target, sender.clone());
              connections.insert(id, connection.handle());
              let closed_sender = closed_sender.clone();
              connection.start(move |id, _reason| {
                let _ = closed_sender.send(id);
              });
            }
            ClientMessage::Frame { id, frame } => match connections.get(&id) {
              Some(connection) => {
                connection.deliver(frame);
              }
              None => tracing::trace!(connection = %id, "Dropping frame for unknown connection"),
            },
            ClientMessage::Aborted { id } => match connections.remove(&id) {
              Some(connection) => {
                tracing::debug!(connection = %id, "Connection aborted by relay");
                connection.close();
              }
              None => tracing::trace!(connection = %id, "Dropping abort for unknown connection"),
            },
            ClientMessage::WellKnownRequest { request_id, path } => {
              tracing::debug!(%request_id, %path, "Resolving well-known request");
              let resolving = resolver.resolve(&path);
              responses.push(
                async move {
                  let content = resolving.await;
                  ClientMessage::WellKnownResponse { request_id, content }
                }
                .boxed(),
              );
            }
            ClientMessage::KeepAlive | ClientMessage::WellKnownResponse { .. } => (),
          }
        }
        Some(id) = closed.recv() => {
          connections.remove(&id);
        }
        Some(response) = responses.next(), if !responses.is_empty() => send(&sender, &response),
        _ = keepalive.tick() => send(&sender, &ClientMessage::KeepAlive),
      }
    };

    tracing::info!(?end, connections = connections.len(), "Client session ended");
    for (_, connection) in connections.drain() {
      connection.close();
    }
    drop(sender);
    drop(incoming);
    if let Some(writer) = writer {
      writer.abort();
    }
    end
  }
}
