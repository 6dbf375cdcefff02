// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Broker tier: authenticates client links and exposes each on the bus

use std::sync::{Arc, Weak};

use anyhow::Context as AnyhowContext;
use dashmap::DashMap;
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpListener,
};
use tracing_futures::Instrument;

use crate::{
  common::{
    authentication::{AuthenticationHandler, TokenError},
    bus::ArcBus,
    node_tracker::{log_node_events, NodeTracker, NodeTrackerConfig},
    protocol::{ClientHandshake, DecodeError},
    session_id::SessionId,
  },
  util::{
    cancellation::ShutdownListener,
    framed::{FramedTransport, ReadError},
  },
};

pub mod session;

pub use session::{BackendConfig, BackendSession, BackendSessionHandle, StopReason};

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("No handshake arrived in time")]
  Timeout,
  #[error("Link closed before the handshake")]
  Closed,
  #[error("Link failed during the handshake: {0}")]
  Transport(#[from] ReadError),
  #[error("Handshake was malformed: {0}")]
  Malformed(#[from] DecodeError),
  #[error("Handshake was refused: {0}")]
  Refused(#[from] TokenError),
}

struct Registry {
  sessions: DashMap<SessionId, BackendSessionHandle>,
  hosts: DashMap<String, BackendSessionHandle>,
}

impl Registry {
  fn forget(&self, id: &SessionId, host: &str) {
    self.sessions.remove(id);
    self.hosts.remove_if(host, |_, current| current.id() == id);
  }
}

pub struct Backend {
  backend_id: SessionId,
  bus: ArcBus,
  authenticator: Arc<dyn AuthenticationHandler>,
  config: BackendConfig,
  registry: Arc<Registry>,
}

impl Backend {
  pub fn new(bus: ArcBus, authenticator: Arc<dyn AuthenticationHandler>, config: BackendConfig) -> Self {
    Self {
      backend_id: SessionId::new(),
      bus,
      authenticator,
      config,
      registry: Arc::new(Registry {
        sessions: DashMap::new(),
        hosts: DashMap::new(),
      }),
    }
  }

  pub fn backend_id(&self) -> &SessionId {
    &self.backend_id
  }

  pub fn session_count(&self) -> usize {
    self.registry.sessions.len()
  }

  /// The live session serving `host`, if any
  pub fn session_for(&self, host: &str) -> Option<BackendSessionHandle> {
    self.registry.hosts.get(host).map(|entry| entry.value().clone())
  }

  /// Authenticates a client link and starts its session, evicting any previous session for the same host
  pub async fn accept<S>(&self, stream: S) -> Result<BackendSessionHandle, HandshakeError>
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let mut transport = FramedTransport::new(stream, self.config.max_frame_length);
    let first = tokio::time::timeout(self.config.handshake_timeout, transport.next_frame())
      .await
      .map_err(|_| HandshakeError::Timeout)?
      .ok_or(HandshakeError::Closed)??;
    let handshake = ClientHandshake::decode(&first)?;
    let access = self.authenticator.authenticate(handshake.token).await?;
    tracing::info!(host = %access.host, "Client authenticated");

    let session = BackendSession::new(
      self.bus.clone(),
      self.backend_id.to_string(),
      access.host.clone(),
      transport,
      self.config,
    );
    let handle = session.handle();
    self.registry.sessions.insert(handle.id().clone(), handle.clone());
    if let Some(previous) = self.registry.hosts.insert(access.host.clone(), handle.clone()) {
      tracing::info!(host = %access.host, previous = %previous.id(), "Replacing previous session");
      previous.stop();
    }
    let registry: Weak<Registry> = Arc::downgrade(&self.registry);
    let host = access.host;
    session.start(move |id, _reason| {
      if let Some(registry) = registry.upgrade() {
        registry.forget(&id, &host);
      }
    });
    Ok(handle)
  }

  pub async fn shutdown(&self) {
    let handles: Vec<_> = self
      .registry
      .sessions
      .iter()
      .map(|entry| entry.value().clone())
      .collect();
    for handle in handles.iter() {
      handle.stop();
    }
    futures::future::join_all(handles.iter().map(|handle| handle.stopped())).await;
  }

  #[tracing::instrument(skip_all, fields(role = "backend", addr = ?listener.local_addr().ok()))]
  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: ShutdownListener) -> anyhow::Result<()> {
    let tracker = NodeTracker::start(self.backend_id.clone(), self.bus.clone(), NodeTrackerConfig::default())
      .await
      .context("Failed to start node tracking")?;
    tokio::task::spawn(log_node_events(tracker.events()).in_current_span());
    tracing::info!(node = %self.backend_id, "Backend started");

    loop {
      let (socket, peer) = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(error) => {
            tracing::warn!(%error, "Failed to accept client link");
            continue;
          }
        },
      };
      let _ = socket.set_nodelay(true);
      let this = self.clone();
      tokio::task::spawn(
        async move {
          if let Err(error) = this.accept(socket).await {
            tracing::info!(%error, "Rejected client link");
          }
        }
        .instrument(tracing::debug_span!("handshake", %peer)),
      );
    }

    tracing::info!(sessions = self.session_count(), "Backend shutting down");
    self.shutdown().await;
    Ok(())
  }
}
