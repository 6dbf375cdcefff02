// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use opentunnel::{
  client::{
    certificates::SelfSignedIssuer, registrar::HttpRegistrar, state::FileStateStore, ClientSessionConfig,
    ClientTunnel, ClientTunnelConfig, HttpWellKnownResolver, ManagedEvent, ManagedTunnel, ManagedTunnelConfig,
  },
  util::cancellation::ShutdownListener,
};
use std::{
  net::{Ipv4Addr, SocketAddr},
  path::PathBuf,
  sync::Arc,
};
use tokio::sync::broadcast::error::RecvError;

/// Tunnel a local port through a relay, with a token minted for the hostname
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub server: String,
  pub token: String,
  pub port: u16,
  pub http_port: u16,
}

/// Self-registering client terminating TLS locally
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ManagedClientArgs {
  pub port: u16,
  pub relay: String,
  pub registrator: String,
  pub state_dir: PathBuf,
}

fn local_service(port: u16) -> SocketAddr {
  SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

pub async fn client_main(args: ClientArgs) -> Result<()> {
  let (shutdown, sigint_handler_task) = ShutdownListener::on_ctrl_c();
  let tunnel = ClientTunnel::new(
    ClientTunnelConfig::new(
      args.server,
      args.token.into_bytes(),
      ClientSessionConfig::new(local_service(args.port)),
    ),
    Arc::new(HttpWellKnownResolver::new(args.http_port)),
  )
  .start();
  shutdown.cancelled().await;
  tunnel.stop().await;
  sigint_handler_task.abort();
  Ok(())
}

pub async fn managed_client_main(args: ManagedClientArgs) -> Result<()> {
  let (shutdown, sigint_handler_task) = ShutdownListener::on_ctrl_c();
  let managed = ManagedTunnel::new(
    ManagedTunnelConfig::new(args.relay, local_service(args.port)),
    Arc::new(HttpRegistrar::new(args.registrator)),
    Arc::new(SelfSignedIssuer::default()),
    Arc::new(FileStateStore::new(args.state_dir)),
  );
  let mut events = managed.events();
  let handle = managed.start().await?;
  tracing::info!(host = handle.host(), "Managed tunnel started");
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      event = events.recv() => match event {
        Ok(ManagedEvent::Ready { host }) => tracing::info!(%host, "Serving at https://{}/", host),
        Ok(ManagedEvent::Connected) => tracing::info!("Connected to relay"),
        Ok(ManagedEvent::Disconnected) => tracing::warn!("Disconnected from relay, reconnecting"),
        Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => break,
      },
    }
  }
  handle.stop().await;
  sigint_handler_task.abort();
  Ok(())
}
