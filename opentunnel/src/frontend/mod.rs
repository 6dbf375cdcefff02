// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Public edge: accepts TLS connections and routes them by SNI without terminating them

use std::sync::{Arc, Weak};

use anyhow::Context as AnyhowContext;
use dashmap::DashMap;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite},
  net::TcpListener,
};
use tracing_futures::Instrument;

use crate::{
  common::{
    bus::ArcBus,
    node_tracker::{log_node_events, NodeTracker, NodeTrackerConfig},
    session_id::SessionId,
    sni::{extract_server_name, ServerNameError},
  },
  util::cancellation::ShutdownListener,
};

pub mod session;
pub mod well_known;

pub use session::{DestroyReason, FrontendConfig, FrontendSession, FrontendSessionHandle};

#[derive(thiserror::Error, Debug)]
pub enum AcceptError {
  #[error("No data arrived within the first-read window")]
  FirstReadTimeout,
  #[error("Connection closed before sending any data")]
  ClosedEarly,
  #[error("Connection read failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Connection could not be routed: {0}")]
  Unroutable(#[from] ServerNameError),
}

type SessionTable = DashMap<SessionId, FrontendSessionHandle>;

pub struct Frontend {
  bus: ArcBus,
  config: FrontendConfig,
  sessions: Arc<SessionTable>,
}

impl Frontend {
  pub fn new(bus: ArcBus, config: FrontendConfig) -> Self {
    Self {
      bus,
      config,
      sessions: Arc::new(DashMap::new()),
    }
  }

  pub fn bus(&self) -> &ArcBus {
    &self.bus
  }

  pub fn session_count(&self) -> usize {
    self.sessions.len()
  }

  pub fn session(&self, id: &SessionId) -> Option<FrontendSessionHandle> {
    self.sessions.get(id).map(|entry| entry.value().clone())
  }

  /// Routes a freshly accepted socket by the server name in its first chunk
  ///
  /// Only the first read is inspected; a chunk too short to hold the whole
  /// ClientHello is rejected rather than buffered.
  pub async fn accept<S>(&self, mut socket: S) -> Result<FrontendSessionHandle, AcceptError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let mut header = vec![0u8; session::SOCKET_READ_CHUNK];
    let length = tokio::time::timeout(self.config.first_read_timeout, socket.read(&mut header))
      .await
      .map_err(|_| AcceptError::FirstReadTimeout)??;
    if length == 0 {
      return Err(AcceptError::ClosedEarly);
    }
    header.truncate(length);
    let host = extract_server_name(&header)?;
    tracing::info!(%host, "New connection");

    let session = FrontendSession::new(self.bus.clone(), host, header, socket, self.config);
    let handle = session.handle();
    self.sessions.insert(handle.id().clone(), handle.clone());
    let table: Weak<SessionTable> = Arc::downgrade(&self.sessions);
    session.start(move |id, _reason| {
      if let Some(table) = table.upgrade() {
        table.remove(&id);
      }
    });
    Ok(handle)
  }

  /// Destroys every live session and waits for their teardown
  pub async fn shutdown(&self) {
    let handles: Vec<_> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
    for handle in handles.iter() {
      handle.destroy();
    }
    futures::future::join_all(handles.iter().map(|handle| handle.destroyed())).await;
  }

  /// Accepts public connections until shutdown, announcing this node on the bus meanwhile
  #[tracing::instrument(skip_all, fields(role = "frontend", addr = ?listener.local_addr().ok()))]
  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: ShutdownListener) -> anyhow::Result<()> {
    let tracker = NodeTracker::start(SessionId::new(), self.bus.clone(), NodeTrackerConfig::default())
      .await
      .context("Failed to start node tracking")?;
    tokio::task::spawn(log_node_events(tracker.events()).in_current_span());
    tracing::info!(node = %tracker.node_id(), "Frontend started");

    loop {
      let (socket, peer) = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(error) => {
            tracing::warn!(%error, "Failed to accept public connection");
            continue;
          }
        },
      };
      let _ = socket.set_nodelay(true);
      let this = self.clone();
      tokio::task::spawn(
        async move {
          if let Err(error) = this.accept(socket).await {
            tracing::debug!(%error, "Dropping unroutable connection");
          }
        }
        .instrument(tracing::debug_span!("accept", %peer)),
      );
    }

    tracing::info!(sessions = self.session_count(), "Frontend shutting down");
    self.shutdown().await;
    Ok(())
  }
}
