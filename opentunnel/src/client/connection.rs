// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Bridges one logical connection to a socket on the local service

use std::net::SocketAddr;

use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
  sync::mpsc,
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    lifecycle::{ConnectionState, Lifecycle},
    protocol::{client_proto::frames_for, ClientMessage},
  },
  util::framed::FrameSender,
};

const LOCAL_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
  /// Closed by the relay side or the owning session
  Requested,
  DialFailed,
  LocalClosed,
  LocalError,
  UpstreamClosed,
}

#[derive(Debug, Clone)]
pub struct ClientConnectionHandle {
  id: String,
  inbound: mpsc::UnboundedSender<Vec<u8>>,
  close: CancellationToken,
}

impl ClientConnectionHandle {
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Queues bytes for the local socket; false once the connection has closed
  pub fn deliver(&self, frame: Vec<u8>) -> bool {
    self.inbound.send(frame).is_ok()
  }

  pub fn close(&self) {
    self.close.cancel();
  }
}

pub struct ClientConnection {
  id: String,
  target: SocketAddr,
  upstream: FrameSender,
  inbound_sender: mpsc::UnboundedSender<Vec<u8>>,
  inbound: mpsc::UnboundedReceiver<Vec<u8>>,
  close: CancellationToken,
}

fn send_upstream(upstream: &FrameSender, message: &ClientMessage) -> bool {
  match message.encode() {
    Ok(frame) => upstream.send(frame).is_ok(),
    Err(error) => {
      tracing::warn!(%error, "Failed to encode client message");
      true
    }
  }
}

impl ClientConnection {
  pub fn new(id: String, target: SocketAddr, upstream: FrameSender) -> Self {
    let (inbound_sender, inbound) = mpsc::unbounded_channel();
    Self {
      id,
      target,
      upstream,
      inbound_sender,
      inbound,
      close: CancellationToken::new(),
    }
  }

  pub fn handle(&self) -> ClientConnectionHandle {
    ClientConnectionHandle {
      id: self.id.clone(),
      inbound: self.inbound_sender.clone(),
      close: self.close.clone(),
    }
  }

  /// Frames delivered before the local dial completes are written once it does
  pub fn start<F>(self, on_closed: F) -> JoinHandle<CloseReason>
  where
    F: FnOnce(String, CloseReason) + Send + 'static,
  {
    let span = tracing::debug_span!("client_connection", role = "client", connection = %self.id);
    tokio::task::spawn(self.run(on_closed).instrument(span))
  }

  async fn run<F>(self, on_closed: F) -> CloseReason
  where
    F: FnOnce(String, CloseReason) + Send + 'static,
  {
    let ClientConnection {
      id,
      target,
      upstream,
      inbound_sender,
      mut inbound,
      close,
    } = self;
    drop(inbound_sender);
    let mut lifecycle = Lifecycle::new(ConnectionState::Dialing);

    let dialed = tokio::select! {
      biased;
      _ = close.cancelled() => Err(CloseReason::Requested),
      dialed = TcpStream::connect(target) => dialed.map_err(|error| {
        tracing::info!(%error, %target, "Local service refused the connection");
        CloseReason::DialFailed
      }),
    };
    let reason = match dialed {
      Ok(socket) => {
        lifecycle.enter(ConnectionState::Connected);
        let _ = socket.set_nodelay(true);
        tracing::debug!("Connected to local service");
        if send_upstream(&upstream, &ClientMessage::Connected { id: id.clone() }) {
          let (reader, writer) = socket.into_split();
          relay(&id, reader, writer, &mut inbound, &upstream, &close).await
        } else {
          CloseReason::UpstreamClosed
        }
      }
      Err(reason) => reason,
    };

    lifecycle.enter(ConnectionState::Closed);
    tracing::debug!(?reason, "Connection closed");
    send_upstream(&upstream, &ClientMessage::Aborted { id: id.clone() });
    on_closed(id, reason);
    reason
  }
}

async fn relay(
  id: &str,
  mut reader: OwnedReadHalf,
  mut writer: OwnedWriteHalf,
  inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
  upstream: &FrameSender,
  close: &CancellationToken,
) -> CloseReason {
  let mut buffer = vec![0u8; LOCAL_READ_CHUNK];
  loop {
    tokio::select! {
      biased;
      _ = close.cancelled() => break CloseReason::Requested,
      frame = inbound.recv() => match frame {
        Some(frame) => {
          if let Err(error) = writer.write_all(&frame).await {
            tracing::debug!(%error, "Local write failed");
            break CloseReason::LocalError;
          }
        }
        None => break CloseReason::Requested,
      },
      read = reader.read(&mut buffer) => match read {
        Ok(0) => break CloseReason::LocalClosed,
        Ok(length) => {
          tracing::trace!(length, "<<");
          if !frames_for(id, &buffer[..length]).all(|message| send_upstream(upstream, &message)) {
            break CloseReason::UpstreamClosed;
          }
        }
        Err(error) => {
          tracing::debug!(%error, "Local read failed");
          break CloseReason::LocalError;
        }
      },
    }
  }
}
