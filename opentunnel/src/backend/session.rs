// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! One authenticated client link, made discoverable on the bus under its hostname

use std::{collections::HashMap, time::Duration};

use futures::{
  future::{BoxFuture, FutureExt},
  stream::FuturesUnordered,
  StreamExt,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_stream::StreamMap;
use tokio_util::{
  sync::CancellationToken,
  time::{delay_queue, DelayQueue},
};
use tracing_futures::Instrument;

use crate::{
  common::{
    bus::{reply, subjects, ArcBus, BusError, BusMessage, Subscription},
    lifecycle::{BackendState, Lifecycle},
    protocol::{
      client_proto::frames_for, ClientMessage, DiscoverReply, InnerSocketMessage, WellKnownReply,
    },
    session_id::SessionId,
  },
  util::{
    dropkick::Dropkick,
    framed::{writer_ended, FrameSender, FramedTransport, DEFAULT_MAX_FRAME_LENGTH},
    slot::{next_in, poll_slot, sleep_until_opt},
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
  /// How long a new link has to present its token
  pub handshake_timeout: Duration,
  /// How long a client has to answer a relayed well-known request
  pub well_known_timeout: Duration,
  pub max_frame_length: Option<usize>,
  /// Disconnect clients silent for longer than this, if set
  pub keepalive_timeout: Option<Duration>,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      handshake_timeout: Duration::from_millis(10000),
      well_known_timeout: Duration::from_millis(5000),
      max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
      keepalive_timeout: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
  Requested,
  SubscribeFailed,
  TransportClosed,
  TransportError,
  KeepAliveTimeout,
  BusClosed,
}

#[derive(Debug, Clone)]
pub struct BackendSessionHandle {
  id: SessionId,
  host: String,
  stop: CancellationToken,
  stopped: CancellationToken,
}

impl BackendSessionHandle {
  pub fn id(&self) -> &SessionId {
    &self.id
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  /// Requests teardown; repeated calls have no further effect
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

type Subscriptions = (Subscription, Subscription, Subscription);

type PendingConnection = BoxFuture<'static, (String, String, Result<Subscription, BusError>)>;

struct PendingWellKnown {
  reply_to: String,
  expiry: delay_queue::Key,
}

pub struct BackendSession {
  id: SessionId,
  host: String,
  backend_id: String,
  bus: ArcBus,
  transport: FramedTransport,
  config: BackendConfig,
  stop: CancellationToken,
  stopped: CancellationToken,
}

fn send_to_client(sender: &FrameSender, message: &ClientMessage) {
  match message.encode() {
    Ok(frame) => {
      if sender.send(frame).is_err() {
        tracing::trace!("Dropping message for a closed client link");
      }
    }
    Err(error) => tracing::warn!(%error, "Failed to encode client message"),
  }
}

async fn publish_inner(bus: &ArcBus, connection_id: &str, message: InnerSocketMessage) {
  let payload = match message.encode() {
    Ok(payload) => payload,
    Err(error) => {
      tracing::warn!(%error, "Failed to encode inner socket message");
      return;
    }
  };
  if let Err(error) = bus
    .publish_to(&subjects::connection_frontend(connection_id), payload)
    .await
  {
    tracing::debug!(%error, connection = connection_id, "Failed to publish to frontend");
  }
}

async fn answer(bus: &ArcBus, request: &BusMessage, payload: Vec<u8>) {
  if let Some(publishing) = reply(&**bus, request, payload) {
    if let Err(error) = publishing.await {
      tracing::debug!(%error, "Failed to reply on the bus");
    }
  }
}

impl BackendSession {
  /// `transport` must already have completed its handshake
  pub fn new(bus: ArcBus, backend_id: String, host: String, transport: FramedTransport, config: BackendConfig) -> Self {
    Self {
      id: SessionId::new(),
      host,
      backend_id,
      bus,
      transport,
      config,
      stop: CancellationToken::new(),
      stopped: CancellationToken::new(),
    }
  }

  pub fn id(&self) -> &SessionId {
    &self.id
  }

  pub fn handle(&self) -> BackendSessionHandle {
    BackendSessionHandle {
      id: self.id.clone(),
      host: self.host.clone(),
      stop: self.stop.clone(),
      stopped: self.stopped.clone(),
    }
  }

  pub fn start<F>(self, on_destroy: F) -> JoinHandle<StopReason>
  where
    F: FnOnce(SessionId, StopReason) + Send + 'static,
  {
    let span = tracing::info_span!("backend_session", role = "backend", id = %self.id, host = %self.host);
    tokio::task::spawn(self.run(on_destroy).instrument(span))
  }

  async fn run<F>(self, on_destroy: F) -> StopReason
  where
    F: FnOnce(SessionId, StopReason) + Send + 'static,
  {
    let BackendSession {
      id,
      host,
      backend_id,
      bus,
      transport,
      config,
      stop,
      stopped,
    } = self;
    let _stopped = Dropkick::new(stopped);
    let (mut incoming, sender, writer) = transport.into_parts();
    let mut writer = Some(writer);
    let mut lifecycle = Lifecycle::new(BackendState::Created);
    let mut discovery: Option<Subscription> = None;
    let mut connects: Option<Subscription> = None;
    let mut well_known: Option<Subscription> = None;
    let mut connections: StreamMap<String, Subscription> = StreamMap::new();
    let mut pending_connections: FuturesUnordered<PendingConnection> = FuturesUnordered::new();
    // Connections still subscribing, with the reply subjects of repeated requests for them
    let mut connecting: HashMap<String, Vec<String>> = HashMap::new();
    let mut pending_well_known: HashMap<String, PendingWellKnown> = HashMap::new();
    let mut well_known_expiry: DelayQueue<String> = DelayQueue::new();
    let keepalive_deadline = |now: Instant| config.keepalive_timeout.map(|window| now + window);
    let mut silence_deadline = keepalive_deadline(Instant::now());

    tracing::info!("Backend session started");
    lifecycle.enter(BackendState::Subscribing);
    let mut subscribing: Option<BoxFuture<'static, Result<Subscriptions, BusError>>> = Some(
      futures::future::try_join3(
        bus.subscribe(&subjects::discover(&host)),
        bus.subscribe(&subjects::connect(id.as_str())),
        bus.subscribe(&subjects::well_known(id.as_str())),
      )
      .boxed(),
    );

    let reason = loop {
      tokio::select! {
        biased;
        _ = stop.cancelled() => break StopReason::Requested,
        subscribed = poll_slot(&mut subscribing) => match subscribed {
          Ok((discover, connect, wk)) => {
            discovery = Some(discover);
            connects = Some(connect);
            well_known = Some(wk);
            lifecycle.enter(BackendState::Started);
            tracing::debug!("Subscriptions active");
          }
          Err(error) => {
            tracing::warn!(%error, "Failed to subscribe");
            break StopReason::SubscribeFailed;
          }
        },
        _ = writer_ended(&mut writer) => break StopReason::TransportError,
        _ = sleep_until_opt(silence_deadline) => {
          tracing::info!("Client fell silent");
          break StopReason::KeepAliveTimeout;
        }
        frame = incoming.next() => {
          let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
              tracing::debug!(%error, "Client link failed");
              break StopReason::TransportError;
            }
            None => break StopReason::TransportClosed,
          };
          silence_deadline = keepalive_deadline(Instant::now());
          let message = match ClientMessage::decode(&frame) {
            Ok(message) => message,
            Err(error) => {
              tracing::debug!(%error, "Discarding malformed client message");
              continue;
            }
          };
          if let Some(connection) = message.connection_id() {
            if !connections.contains_key(connection) {
              tracing::trace!(connection, "Dropping message for unknown connection");
              continue;
            }
          }
          match message {
            ClientMessage::Connected { id } => publish_inner(&bus, &id, InnerSocketMessage::Connected).await,
            ClientMessage::Frame { id, frame } => publish_inner(&bus, &id, InnerSocketMessage::Frame(frame)).await,
            ClientMessage::Aborted { id } => {
              connections.remove(&id);
              tracing::info!(connection = %id, "Connection aborted by client");
              publish_inner(&bus, &id, InnerSocketMessage::Aborted).await;
            }
            ClientMessage::WellKnownResponse { request_id, content } => {
              match pending_well_known.remove(&request_id) {
                Some(pending) => {
                  well_known_expiry.remove(&pending.expiry);
                  match WellKnownReply(content).encode() {
                    Ok(payload) => {
                      if let Err(error) = bus.publish_to(&pending.reply_to, payload).await {
                        tracing::debug!(%error, "Failed to answer well-known request");
                      }
                    }
                    Err(error) => tracing::warn!(%error, "Well-known content cannot be relayed"),
                  }
                }
                None => tracing::trace!(%request_id, "Dropping late well-known response"),
              }
            }
            ClientMessage::KeepAlive => tracing::trace!("Keep-alive"),
            ClientMessage::WellKnownRequest { .. } => tracing::debug!("Ignoring well-known request from client"),
          }
        }
        request = next_in(&mut discovery) => match request {
          Some(request) => {
            let found = DiscoverReply {
              backend_id: backend_id.clone(),
              socket_id: id.to_string(),
            };
            match found.encode() {
              Ok(payload) => answer(&bus, &request, payload).await,
              Err(error) => tracing::warn!(%error, "Failed to encode discovery reply"),
            }
          }
          None => break StopReason::BusClosed,
        },
        request = next_in(&mut connects) => match request {
          Some(request) => {
            let reply_to = match request.reply_to.clone() {
              Some(reply_to) => reply_to,
              None => continue,
            };
            let connection = match std::str::from_utf8(&request.payload) {
              Ok(connection) if !connection.is_empty() && connection.is_ascii() => connection.to_string(),
              _ => {
                tracing::debug!("Discarding malformed connect request");
                continue;
              }
            };
            if connections.contains_key(&connection) {
              tracing::debug!(%connection, "Repeated connect request");
              answer(&bus, &request, Vec::new()).await;
              continue;
            }
            if let Some(waiting) = connecting.get_mut(&connection) {
              tracing::debug!(%connection, "Repeated connect request while subscribing");
              waiting.push(reply_to);
              continue;
            }
            tracing::info!(%connection, "New connection");
            connecting.insert(connection.clone(), Vec::new());
            let subscribing = bus.subscribe(&subjects::connection_backend(&connection));
            pending_connections.push(
              async move { (connection, reply_to, subscribing.await) }.boxed(),
            );
          }
          None => break StopReason::BusClosed,
        },
        Some((connection, reply_to, subscribed)) = pending_connections.next(), if !pending_connections.is_empty() => {
          let repeated = connecting.remove(&connection).unwrap_or_default();
          match subscribed {
            Ok(subscription) => {
              connections.insert(connection.clone(), subscription);
              send_to_client(&sender, &ClientMessage::Connected { id: connection });
              for reply_to in std::iter::once(reply_to).chain(repeated) {
                if let Err(error) = bus.publish_to(&reply_to, Vec::new()).await {
                  tracing::debug!(%error, "Failed to acknowledge connect request");
                }
              }
            }
            Err(error) => tracing::warn!(%connection, %error, "Failed to subscribe for connection"),
          }
        }
        Some((connection, message)) = connections.next(), if !connections.is_empty() => {
          match InnerSocketMessage::decode(&message.payload) {
            Ok(InnerSocketMessage::Frame(frame)) => {
              tracing::trace!(%connection, length = frame.len(), ">>");
              for message in frames_for(&connection, &frame) {
                send_to_client(&sender, &message);
              }
            }
            Ok(InnerSocketMessage::Aborted) => {
              tracing::info!(%connection, "Connection aborted by frontend");
              connections.remove(&connection);
              send_to_client(&sender, &ClientMessage::Aborted { id: connection });
            }
            Ok(InnerSocketMessage::Connected) => (),
            Err(error) => tracing::debug!(%error, "Discarding malformed inner socket message"),
          }
        }
        request = next_in(&mut well_known) => match request {
          Some(request) => {
            let reply_to = match request.reply_to.clone() {
              Some(reply_to) => reply_to,
              None => continue,
            };
            let path = match String::from_utf8(request.payload) {
              Ok(path) if path.is_ascii() => path,
              _ => {
                tracing::debug!("Discarding malformed well-known request");
                continue;
              }
            };
            let request_id = SessionId::new().to_string();
            tracing::debug!(%request_id, %path, "Relaying well-known request");
            let expiry = well_known_expiry.insert(request_id.clone(), config.well_known_timeout);
            pending_well_known.insert(request_id.clone(), PendingWellKnown { reply_to, expiry });
            send_to_client(&sender, &ClientMessage::WellKnownRequest { request_id, path });
          }
          None => break StopReason::BusClosed,
        },
        Some(expired) = well_known_expiry.next(), if !well_known_expiry.is_empty() => {
          let request_id = expired.into_inner();
          if let Some(pending) = pending_well_known.remove(&request_id) {
            tracing::debug!(%request_id, "Well-known request went unanswered");
            if let Ok(payload) = WellKnownReply(None).encode() {
              let _ = bus.publish_to(&pending.reply_to, payload).await;
            }
          }
        }
      }
    };

    lifecycle.enter(BackendState::Stopped);
    tracing::info!(?reason, connections = connections.len(), "Backend session stopped");
    drop(subscribing);
    drop(discovery);
    drop(connects);
    drop(well_known);
    drop(pending_connections);
    let live: Vec<String> = connections.keys().cloned().collect();
    drop(connections);
    for connection in live {
      publish_inner(&bus, &connection, InnerSocketMessage::Aborted).await;
    }
    if let Ok(payload) = WellKnownReply(None).encode() {
      for (_, pending) in pending_well_known.drain() {
        let _ = bus.publish_to(&pending.reply_to, payload.clone()).await;
      }
    }
    drop(sender);
    drop(incoming);
    if let Some(writer) = writer {
      writer.abort();
    }
    on_destroy(id, reason);
    reason
  }
}
