// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Plain-HTTP side of the edge: well-known paths relayed to clients, everything else upgraded to HTTPS

use hyper::{body::Incoming, Method, Request, StatusCode};
use tokio::net::TcpListener;

use super::session::{discover, FrontendConfig};
use crate::{
  common::{
    bus::{subjects, ArcBus, BusError},
    protocol::{DecodeError, WellKnownReply},
  },
  util::{
    cancellation::ShutdownListener,
    http::{request_host, respond, serve_http, HttpResponse},
  },
};

const WELL_KNOWN_PREFIX: &str = "/.well-known";

#[derive(thiserror::Error, Debug)]
pub enum WellKnownError {
  #[error("No backend serves {0}")]
  Undiscoverable(String),
  #[error("Well-known request failed: {0}")]
  Bus(#[from] BusError),
  #[error("Well-known reply was malformed: {0}")]
  Malformed(#[from] DecodeError),
}

/// Fetches `/.well-known{path}` from the client currently serving `host`
#[tracing::instrument(level = "debug", skip(bus, config), err)]
pub async fn request_well_known(
  bus: &ArcBus,
  host: &str,
  path: &str,
  config: &FrontendConfig,
) -> Result<Option<Vec<u8>>, WellKnownError> {
  let found = discover(bus, host, config.discovery_attempts, config.request_timeout)
    .await
    .ok_or_else(|| WellKnownError::Undiscoverable(host.to_string()))?;
  let reply = bus
    .request(
      &subjects::well_known(&found.socket_id),
      path.as_bytes().to_vec(),
      config.request_timeout,
    )
    .await?;
  Ok(WellKnownReply::decode(&reply.payload)?.0)
}

async fn handle(bus: ArcBus, config: FrontendConfig, request: Request<Incoming>) -> HttpResponse {
  let path = request.uri().path().to_string();
  if path == "/healthz" {
    return respond(StatusCode::OK, "/healthz");
  }
  let host = match request_host(&request) {
    Some(host) => host,
    None => return respond(StatusCode::BAD_REQUEST, "Missing host"),
  };
  if *request.method() == Method::GET && path.starts_with(WELL_KNOWN_PREFIX) {
    let subpath = &path[WELL_KNOWN_PREFIX.len()..];
    if !subpath.is_ascii() {
      return respond(StatusCode::NOT_FOUND, "Not found");
    }
    tracing::info!(%host, path = subpath, "Relaying well-known request");
    return match request_well_known(&bus, &host, subpath, &config).await {
      Ok(Some(content)) => respond(StatusCode::OK, content),
      Ok(None) => respond(StatusCode::NOT_FOUND, "Not found"),
      Err(error) => {
        tracing::warn!(%host, %error, "Well-known request failed");
        respond(StatusCode::NOT_FOUND, "Not found")
      }
    };
  }
  let authority = request
    .headers()
    .get(hyper::header::HOST)
    .and_then(|value| value.to_str().ok())
    .unwrap_or(&host)
    .to_string();
  let target = request
    .uri()
    .path_and_query()
    .map(|p| p.as_str())
    .unwrap_or("/");
  let mut response = respond(StatusCode::MOVED_PERMANENTLY, "");
  match hyper::header::HeaderValue::from_str(&format!("https://{}{}", authority, target)) {
    Ok(location) => {
      response.headers_mut().insert(hyper::header::LOCATION, location);
      response
    }
    Err(_) => respond(StatusCode::BAD_REQUEST, "Bad host"),
  }
}

/// Serves the edge's HTTP port until shutdown
#[tracing::instrument(skip_all, fields(role = "frontend-http", addr = ?listener.local_addr().ok()))]
pub async fn serve_http_edge(bus: ArcBus, config: FrontendConfig, listener: TcpListener, shutdown: ShutdownListener) {
  tracing::info!("HTTP edge started");
  serve_http(listener, shutdown, move |request| {
    handle(bus.clone(), config, request)
  })
  .await
}
