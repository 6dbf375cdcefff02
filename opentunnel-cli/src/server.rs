// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::keys::signing_key_from_env;
use anyhow::{Context as AnyhowContext, Result};
use opentunnel::{
  backend::{Backend, BackendConfig},
  common::{
    authentication::{parse_verifying_key, SignedTokenAuthenticator},
    bus::{ArcBus, InMemoryBus},
  },
  frontend::{well_known::serve_http_edge, Frontend, FrontendConfig},
  registrator::Registrator,
  util::cancellation::ShutdownListener,
};
use std::{
  net::{IpAddr, Ipv6Addr, SocketAddr},
  sync::Arc,
};
use tokio::net::TcpListener;

/// Public edge: TLS routed by SNI plus the plain-HTTP side
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct FrontendArgs {
  pub port: u16,
  pub http_port: u16,
  pub bus_url: String,
}

/// Broker tier accepting client links
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct BackendArgs {
  pub public_key: String,
  pub port: u16,
  pub bus_url: String,
}

/// Frontend and backend sharing one process and an in-memory bus
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RelayArgs {
  pub public_key: String,
  pub port: u16,
  pub http_port: u16,
  pub backend_port: u16,
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RegistratorArgs {
  pub base_host: String,
  pub port: u16,
}

async fn bind(port: u16) -> Result<TcpListener> {
  let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
  match TcpListener::bind(addr).await {
    Ok(listener) => Ok(listener),
    Err(_) => TcpListener::bind(("0.0.0.0", port))
      .await
      .with_context(|| format!("Failed to bind port {}", port)),
  }
}

#[cfg(feature = "redis-bus")]
async fn connect_bus(url: &str) -> Result<ArcBus> {
  use opentunnel::common::bus::redis::{RedisBus, RedisBusConfig};
  let bus = RedisBus::connect(RedisBusConfig::with_url(url))
    .await
    .with_context(|| format!("Failed to connect to the bus at {}", url))?;
  Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis-bus"))]
async fn connect_bus(url: &str) -> Result<ArcBus> {
  anyhow::bail!(
    "Connecting to the bus at {} requires building with the `redis-bus` feature; use `relay` to run both tiers on an in-memory bus",
    url
  )
}

fn authenticator(public_key: &str) -> Result<Arc<SignedTokenAuthenticator>> {
  let key = parse_verifying_key(public_key).context("Public key must be a base64 ed25519 key")?;
  Ok(Arc::new(SignedTokenAuthenticator::new(key)))
}

pub async fn frontend_main(args: FrontendArgs) -> Result<()> {
  let bus = connect_bus(&args.bus_url).await?;
  let public = bind(args.port).await?;
  let http = bind(args.http_port).await?;
  let (shutdown, sigint_handler_task) = ShutdownListener::on_ctrl_c();
  let config = FrontendConfig::default();
  let frontend = Arc::new(Frontend::new(bus.clone(), config));
  let http_edge = tokio::task::spawn(serve_http_edge(bus, config, http, shutdown.clone()));
  frontend.serve(public, shutdown).await?;
  let _ = http_edge.await;
  sigint_handler_task.abort();
  Ok(())
}

pub async fn backend_main(args: BackendArgs) -> Result<()> {
  let authenticator = authenticator(&args.public_key)?;
  let bus = connect_bus(&args.bus_url).await?;
  let listener = bind(args.port).await?;
  let (shutdown, sigint_handler_task) = ShutdownListener::on_ctrl_c();
  let backend = Arc::new(Backend::new(bus, authenticator, BackendConfig::default()));
  backend.serve(listener, shutdown).await?;
  sigint_handler_task.abort();
  Ok(())
}

pub async fn relay_main(args: RelayArgs) -> Result<()> {
  let authenticator = authenticator(&args.public_key)?;
  let bus: ArcBus = Arc::new(InMemoryBus::new());
  let public = bind(args.port).await?;
  let http = bind(args.http_port).await?;
  let backhaul = bind(args.backend_port).await?;
  let (shutdown, sigint_handler_task) = ShutdownListener::on_ctrl_c();
  let config = FrontendConfig::default();
  let frontend = Arc::new(Frontend::new(bus.clone(), config));
  let backend = Arc::new(Backend::new(bus.clone(), authenticator, BackendConfig::default()));
  let http_edge = serve_http_edge(bus, config, http, shutdown.clone());
  let ((), (), ()) = tokio::try_join!(
    frontend.serve(public, shutdown.clone()),
    backend.serve(backhaul, shutdown.clone()),
    async move {
      http_edge.await;
      Ok::<(), anyhow::Error>(())
    },
  )?;
  sigint_handler_task.abort();
  Ok(())
}

pub async fn registrator_main(args: RegistratorArgs) -> Result<()> {
  let key = signing_key_from_env()?;
  let listener = bind(args.port).await?;
  let (shutdown, sigint_handler_task) = ShutdownListener::on_ctrl_c();
  Arc::new(Registrator::new(args.base_host, key))
    .serve(listener, shutdown)
    .await?;
  sigint_handler_task.abort();
  Ok(())
}
