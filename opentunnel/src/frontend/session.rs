// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! One accepted public connection, relayed to whichever backend serves its hostname

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  task::JoinHandle,
  time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    bus::{subjects, ArcBus, BusError, BusMessage, Subscription},
    lifecycle::{FrontendState, Lifecycle},
    protocol::{DiscoverReply, InnerSocketMessage},
    session_id::SessionId,
  },
  util::{
    dropkick::Dropkick,
    slot::{next_in, poll_slot, sleep_until_opt},
  },
};

/// Read size for public sockets; stays well below the inner frame limit
pub(crate) const SOCKET_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontendConfig {
  pub discovery_attempts: u32,
  /// Applies to each discovery attempt and to the single connect request
  pub request_timeout: Duration,
  /// How long an acknowledged connect may go unconfirmed
  pub establish_timeout: Duration,
  /// How long a freshly accepted socket has to send its ClientHello
  pub first_read_timeout: Duration,
}

impl Default for FrontendConfig {
  fn default() -> Self {
    Self {
      discovery_attempts: 3,
      request_timeout: Duration::from_millis(5000),
      establish_timeout: Duration::from_millis(10000),
      first_read_timeout: Duration::from_millis(10000),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
  Requested,
  SocketClosed,
  SocketError,
  DiscoveryExhausted,
  SubscribeFailed,
  ConnectFailed,
  EstablishTimeout,
  Aborted,
  BusClosed,
}

/// Discovers the backend socket serving `host`, trying up to `attempts` times
pub(crate) async fn discover(
  bus: &ArcBus,
  host: &str,
  attempts: u32,
  timeout: Duration,
) -> Option<DiscoverReply> {
  for attempt in 1..=attempts {
    match bus.request(&subjects::discover(host), Vec::new(), timeout).await {
      Ok(reply) => match DiscoverReply::decode(&reply.payload) {
        Ok(found) => return Some(found),
        Err(error) => tracing::debug!(attempt, %error, "Discarding malformed discovery reply"),
      },
      Err(error) => tracing::debug!(attempt, %error, "Discovery attempt failed"),
    }
  }
  None
}

/// Control handle for a running session; safe to clone and to use after the session ends
#[derive(Debug, Clone)]
pub struct FrontendSessionHandle {
  id: SessionId,
  stop: CancellationToken,
  destroyed: CancellationToken,
}

impl FrontendSessionHandle {
  pub fn id(&self) -> &SessionId {
    &self.id
  }

  /// Requests teardown; repeated calls have no further effect
  pub fn destroy(&self) {
    self.stop.cancel();
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.is_cancelled()
  }

  /// Resolves once teardown has completed
  pub async fn destroyed(&self) {
    self.destroyed.cancelled().await
  }
}

enum Step {
  Discovered(Result<(DiscoverReply, Subscription), DestroyReason>),
  ConnectAcknowledged(Result<BusMessage, BusError>),
}

pub struct FrontendSession<S> {
  id: SessionId,
  host: String,
  header: Vec<u8>,
  socket: S,
  bus: ArcBus,
  config: FrontendConfig,
  stop: CancellationToken,
  destroyed: CancellationToken,
}

impl<S> FrontendSession<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  /// `header` is the first chunk read from `socket`, already consumed for routing
  pub fn new(bus: ArcBus, host: String, header: Vec<u8>, socket: S, config: FrontendConfig) -> Self {
    Self {
      id: SessionId::new(),
      host,
      header,
      socket,
      bus,
      config,
      stop: CancellationToken::new(),
      destroyed: CancellationToken::new(),
    }
  }

  pub fn id(&self) -> &SessionId {
    &self.id
  }

  pub fn handle(&self) -> FrontendSessionHandle {
    FrontendSessionHandle {
      id: self.id.clone(),
      stop: self.stop.clone(),
      destroyed: self.destroyed.clone(),
    }
  }

  /// Runs the session on its own task; `on_destroy` fires exactly once, after teardown
  pub fn start<F>(self, on_destroy: F) -> JoinHandle<DestroyReason>
  where
    F: FnOnce(SessionId, DestroyReason) + Send + 'static,
  {
    let span = tracing::info_span!("frontend_session", role = "frontend", id = %self.id, host = %self.host);
    tokio::task::spawn(self.run(on_destroy).instrument(span))
  }

  fn establish(bus: ArcBus, host: String, id: SessionId, config: FrontendConfig) -> BoxFuture<'static, Step> {
    async move {
      let found = match discover(&bus, &host, config.discovery_attempts, config.request_timeout).await {
        Some(found) => found,
        None => return Step::Discovered(Err(DestroyReason::DiscoveryExhausted)),
      };
      tracing::info!(backend = %found.backend_id, socket = %found.socket_id, "Discovered backend");
      match bus.subscribe(&subjects::connection_frontend(id.as_str())).await {
        Ok(inbound) => Step::Discovered(Ok((found, inbound))),
        Err(error) => {
          tracing::warn!(%error, "Failed to subscribe to inbound connection subject");
          Step::Discovered(Err(DestroyReason::SubscribeFailed))
        }
      }
    }
    .boxed()
  }

  async fn publish_inner(bus: &ArcBus, subject: &str, message: InnerSocketMessage) {
    let payload = match message.encode() {
      Ok(payload) => payload,
      Err(error) => {
        tracing::warn!(%error, "Failed to encode inner socket message");
        return;
      }
    };
    if let Err(error) = bus.publish_to(subject, payload).await {
      tracing::debug!(%error, "Failed to publish inner socket message");
    }
  }

  async fn run<F>(self, on_destroy: F) -> DestroyReason
  where
    F: FnOnce(SessionId, DestroyReason) + Send + 'static,
  {
    let FrontendSession {
      id,
      host,
      header,
      socket,
      bus,
      config,
      stop,
      destroyed,
    } = self;
    let _destroyed = Dropkick::new(destroyed);
    let outbound = subjects::connection_backend(id.as_str());
    let mut lifecycle = Lifecycle::new(FrontendState::Created);
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut read_buffer = vec![0u8; SOCKET_READ_CHUNK];
    let mut pending: Vec<Vec<u8>> = vec![header];
    let mut inbound: Option<Subscription> = None;
    let mut deadline: Option<Instant> = None;
    let mut step = None;

    tracing::info!("Frontend session started");
    lifecycle.enter(FrontendState::Discovering);
    if !stop.is_cancelled() {
      step = Some(Self::establish(bus.clone(), host.clone(), id.clone(), config));
    }

    let reason = loop {
      tokio::select! {
        biased;
        _ = stop.cancelled() => break DestroyReason::Requested,
        finished = poll_slot(&mut step) => match finished {
          Step::Discovered(Err(reason)) => break reason,
          Step::Discovered(Ok((found, subscription))) => {
            inbound = Some(subscription);
            lifecycle.enter(FrontendState::Connecting);
            let request = bus.request(
              &subjects::connect(&found.socket_id),
              id.as_str().as_bytes().to_vec(),
              config.request_timeout,
            );
            step = Some(request.map(Step::ConnectAcknowledged).boxed());
          }
          Step::ConnectAcknowledged(Err(error)) => {
            tracing::info!(%error, "Connect request failed");
            break DestroyReason::ConnectFailed;
          }
          Step::ConnectAcknowledged(Ok(_)) => {
            if !lifecycle.is(FrontendState::Established) {
              deadline = Some(Instant::now() + config.establish_timeout);
            }
          }
        },
        _ = sleep_until_opt(deadline) => {
          tracing::info!("Backend never confirmed the connection");
          break DestroyReason::EstablishTimeout;
        }
        message = next_in(&mut inbound) => {
          let message = match message {
            Some(message) => message,
            None => break DestroyReason::BusClosed,
          };
          match InnerSocketMessage::decode(&message.payload) {
            Ok(InnerSocketMessage::Connected) => {
              if lifecycle.advance(FrontendState::Established).is_ok() {
                deadline = None;
                tracing::info!(buffered = pending.len(), "Connection established");
                for chunk in pending.drain(..) {
                  Self::publish_inner(&bus, &outbound, InnerSocketMessage::Frame(chunk)).await;
                }
              } else {
                tracing::trace!("Ignoring repeated connected notification");
              }
            }
            Ok(InnerSocketMessage::Frame(frame)) => {
              tracing::trace!(length = frame.len(), "<<");
              if let Err(error) = writer.write_all(&frame).await {
                tracing::debug!(%error, "Public socket write failed");
                break DestroyReason::SocketError;
              }
            }
            Ok(InnerSocketMessage::Aborted) => {
              tracing::info!("Aborted by backend");
              break DestroyReason::Aborted;
            }
            Err(error) => tracing::debug!(%error, "Discarding malformed inner socket message"),
          }
        }
        read = reader.read(&mut read_buffer) => match read {
          Ok(0) => break DestroyReason::SocketClosed,
          Ok(length) => {
            let chunk = read_buffer[..length].to_vec();
            tracing::trace!(length, ">>");
            if lifecycle.is(FrontendState::Established) {
              Self::publish_inner(&bus, &outbound, InnerSocketMessage::Frame(chunk)).await;
            } else {
              pending.push(chunk);
            }
          }
          Err(error) => {
            tracing::debug!(%error, "Public socket read failed");
            break DestroyReason::SocketError;
          }
        },
      }
    };

    // While connecting, `step` holds the unanswered connect request
    let unanswered_connect = if lifecycle.is(FrontendState::Connecting) {
      step.take()
    } else {
      None
    };
    lifecycle.enter(FrontendState::Destroyed);
    tracing::info!(?reason, "Frontend session destroyed");
    drop(step);
    drop(reader);
    drop(writer);
    drop(inbound);
    Self::publish_inner(&bus, &outbound, InnerSocketMessage::Aborted).await;
    if let Some(connect) = unanswered_connect {
      // The backend subscribes before acknowledging, so the abort above may have reached no one
      let bus = bus.clone();
      let outbound = outbound.clone();
      tokio::task::spawn(
        async move {
          if let Step::ConnectAcknowledged(Ok(_)) = connect.await {
            tracing::debug!("Connect acknowledged after destroy; aborting again");
            Self::publish_inner(&bus, &outbound, InnerSocketMessage::Aborted).await;
          }
        }
        .in_current_span(),
      );
    }
    on_destroy(id, reason);
    reason
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use futures::StreamExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  use super::{DestroyReason, FrontendConfig, FrontendSession};
  use crate::common::{
    bus::{reply, subjects, ArcBus, Bus, InMemoryBus, Subscription},
    protocol::{DiscoverReply, InnerSocketMessage},
  };

  const HOST: &str = "a.example.com";
  const SOCKET_ID: &str = "backend-socket";

  /// Answers discovery and connect requests the way a backend would, optionally confirming connections
  fn fake_backend(bus: InMemoryBus, confirm: bool, confirm_before_ack: bool) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
      let mut discovery = bus.subscribe(&subjects::discover(HOST)).await.unwrap();
      let mut connects = bus.subscribe(&subjects::connect(SOCKET_ID)).await.unwrap();
      loop {
        tokio::select! {
          Some(request) = discovery.next() => {
            let found = DiscoverReply {
              backend_id: "backend".into(),
              socket_id: SOCKET_ID.into(),
            };
            reply(&bus, &request, found.encode().unwrap()).unwrap().await.unwrap();
          }
          Some(request) = connects.next() => {
            let id = String::from_utf8(request.payload.clone()).unwrap();
            let connected = InnerSocketMessage::Connected.encode().unwrap();
            if confirm && confirm_before_ack {
              bus.publish_to(&subjects::connection_frontend(&id), connected.clone()).await.unwrap();
            }
            reply(&bus, &request, Vec::new()).unwrap().await.unwrap();
            if confirm && !confirm_before_ack {
              bus.publish_to(&subjects::connection_frontend(&id), connected).await.unwrap();
            }
          }
          else => break,
        }
      }
    })
  }

  fn session(bus: &InMemoryBus) -> (FrontendSession<DuplexStream>, DuplexStream) {
    let (public, remote) = tokio::io::duplex(64 * 1024);
    let arc: ArcBus = Arc::new(bus.clone());
    let session = FrontendSession::new(arc, HOST.into(), b"hello".to_vec(), public, FrontendConfig::default());
    (session, remote)
  }

  async fn next_inner(subscription: &mut Subscription) -> InnerSocketMessage {
    InnerSocketMessage::decode(&subscription.next().await.unwrap().payload).unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn double_destroy_notifies_upstream_once() {
    let bus = InMemoryBus::new();
    let (session, _remote) = session(&bus);
    let mut upstream = bus
      .subscribe(&subjects::connection_backend(session.id().as_str()))
      .await
      .unwrap();
    let handle = session.handle();
    let callbacks = Arc::new(AtomicUsize::new(0));
    let counted = callbacks.clone();
    let task = session.start(move |_, _| {
      counted.fetch_add(1, Ordering::SeqCst);
    });
    handle.destroy();
    handle.destroy();
    handle.destroyed().await;
    handle.destroy();
    assert_eq!(task.await.unwrap(), DestroyReason::Requested);

    assert_eq!(next_inner(&mut upstream).await, InnerSocketMessage::Aborted);
    let extra = tokio::time::timeout(Duration::from_secs(30), upstream.next()).await;
    assert!(extra.is_err(), "Only one abort may be published");
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(
      bus.subscriber_count(&subjects::connection_frontend(handle.id().as_str())),
      0
    );
  }

  #[tokio::test(start_paused = true)]
  async fn discovery_exhaustion_closes_without_connecting() {
    let bus = InMemoryBus::new();
    let mut discovery = bus.subscribe(&subjects::discover(HOST)).await.unwrap();
    let mut connects = bus.subscribe(&subjects::connect(SOCKET_ID)).await.unwrap();
    let (session, mut remote) = session(&bus);
    let started = tokio::time::Instant::now();
    let task = session.start(|_, _| ());

    assert_eq!(task.await.unwrap(), DestroyReason::DiscoveryExhausted);
    assert!(started.elapsed() >= Duration::from_secs(15));
    let mut attempts = 0;
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(1), discovery.next()).await {
      attempts += 1;
    }
    assert_eq!(attempts, 3);
    assert!(tokio::time::timeout(Duration::from_millis(1), connects.next()).await.is_err());
    let mut rest = Vec::new();
    assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0, "Public socket must be closed");
  }

  #[tokio::test(start_paused = true)]
  async fn unconfirmed_connections_time_out() {
    let bus = InMemoryBus::new();
    let _backend = fake_backend(bus.clone(), false, false);
    tokio::task::yield_now().await;
    let (session, _remote) = session(&bus);
    let started = tokio::time::Instant::now();
    let reason = session.start(|_, _| ()).await.unwrap();
    assert_eq!(reason, DestroyReason::EstablishTimeout);
    assert!(started.elapsed() >= Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn buffered_bytes_flush_in_order_once_connected() {
    let bus = InMemoryBus::new();
    let _backend = fake_backend(bus.clone(), true, false);
    tokio::task::yield_now().await;
    let (session, mut remote) = session(&bus);
    let id = session.id().clone();
    let mut upstream = bus.subscribe(&subjects::connection_backend(id.as_str())).await.unwrap();
    remote.write_all(b" world").await.unwrap();
    let handle = session.handle();
    let _task = session.start(|_, _| ());

    let mut received = Vec::new();
    while received.len() < b"hello world".len() {
      match next_inner(&mut upstream).await {
        InnerSocketMessage::Frame(frame) => received.extend(frame),
        other => panic!("Unexpected {:?}", other),
      }
    }
    assert_eq!(received, b"hello world");

    remote.write_all(b"!").await.unwrap();
    assert_eq!(next_inner(&mut upstream).await, InnerSocketMessage::Frame(b"!".to_vec()));

    let downstream = InnerSocketMessage::Frame(b"reply".to_vec()).encode().unwrap();
    bus.publish_to(&subjects::connection_frontend(id.as_str()), downstream).await.unwrap();
    let mut buffer = [0u8; 5];
    remote.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"reply");

    // Established sessions outlive the confirmation window
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!handle.is_destroyed());

    let abort = InnerSocketMessage::Aborted.encode().unwrap();
    bus.publish_to(&subjects::connection_frontend(id.as_str()), abort).await.unwrap();
    handle.destroyed().await;
  }

  #[tokio::test(start_paused = true)]
  async fn confirmation_before_acknowledgement_is_honored() {
    let bus = InMemoryBus::new();
    let _backend = fake_backend(bus.clone(), true, true);
    tokio::task::yield_now().await;
    let (session, _remote) = session(&bus);
    let handle = session.handle();
    let _task = session.start(|_, _| ());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!handle.is_destroyed(), "A late acknowledgement must not arm the confirmation timer");
  }

  #[tokio::test(start_paused = true)]
  async fn destroy_during_connect_still_reaches_the_backend() {
    let bus = InMemoryBus::new();
    let (connect_seen, connect_received) = tokio::sync::oneshot::channel();
    let (abort_seen, abort_received) = tokio::sync::oneshot::channel();
    let backend = bus.clone();
    tokio::task::spawn(async move {
      let mut discovery = backend.subscribe(&subjects::discover(HOST)).await.unwrap();
      let mut connects = backend.subscribe(&subjects::connect(SOCKET_ID)).await.unwrap();
      let request = discovery.next().await.unwrap();
      let found = DiscoverReply {
        backend_id: "backend".into(),
        socket_id: SOCKET_ID.into(),
      };
      reply(&backend, &request, found.encode().unwrap()).unwrap().await.unwrap();
      let request = connects.next().await.unwrap();
      let _ = connect_seen.send(());
      // Slow to subscribe, then acknowledge, like a loaded backend
      tokio::time::sleep(Duration::from_millis(100)).await;
      let id = String::from_utf8(request.payload.clone()).unwrap();
      let mut inbound = backend.subscribe(&subjects::connection_backend(&id)).await.unwrap();
      reply(&backend, &request, Vec::new()).unwrap().await.unwrap();
      let received = tokio::time::timeout(Duration::from_secs(30), inbound.next()).await;
      let _ = abort_seen.send(received.ok().flatten().map(|message| message.payload));
    });
    tokio::task::yield_now().await;

    let (session, remote) = session(&bus);
    let task = session.start(|_, _| ());
    connect_received.await.unwrap();
    drop(remote);
    assert_eq!(task.await.unwrap(), DestroyReason::SocketClosed);

    let payload = abort_received.await.unwrap().expect("Backend must hear the abort");
    assert_eq!(InnerSocketMessage::decode(&payload).unwrap(), InnerSocketMessage::Aborted);
  }

  #[tokio::test(start_paused = true)]
  async fn closing_the_public_socket_destroys() {
    let bus = InMemoryBus::new();
    let _backend = fake_backend(bus.clone(), true, false);
    tokio::task::yield_now().await;
    let (session, remote) = session(&bus);
    let task = session.start(|_, _| ());
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(remote);
    assert_eq!(task.await.unwrap(), DestroyReason::SocketClosed);
  }
}
