// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Hands out random public hostnames together with access tokens for them

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use hyper::{body::Incoming, header, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::{
  common::authentication::{sign_token, TokenError},
  util::{
    cancellation::ShutdownListener,
    http::{respond, serve_http, HttpResponse},
  },
};

const BANNER: &str = "opentunnel registrator";

/// A hostname and the token that lets a client serve it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
  pub host: String,
  pub token: String,
}

pub struct Registrator {
  base_host: String,
  signing_key: SigningKey,
}

impl Registrator {
  pub fn new(base_host: impl Into<String>, signing_key: SigningKey) -> Self {
    Self {
      base_host: base_host.into().to_ascii_lowercase(),
      signing_key,
    }
  }

  /// A fresh `{random}.{base}` hostname with a never-expiring token
  pub fn mint(&self) -> Result<Registration, TokenError> {
    let host = format!("{}.{}", uuid::Uuid::new_v4().simple(), self.base_host);
    let token = sign_token(&self.signing_key, &host, None)?;
    Ok(Registration { host, token })
  }

  async fn handle(self: Arc<Self>, request: Request<Incoming>) -> HttpResponse {
    match (request.method(), request.uri().path()) {
      (&Method::GET, "/") => respond(StatusCode::OK, BANNER),
      (&Method::POST, "/random") => {
        let body = self
          .mint()
          .map_err(anyhow::Error::from)
          .and_then(|registration| serde_json::to_vec(&registration).map_err(anyhow::Error::from));
        match body {
          Ok(body) => {
            tracing::info!("Minted hostname");
            let mut response = respond(StatusCode::OK, body);
            response
              .headers_mut()
              .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
            response
          }
          Err(error) => {
            tracing::warn!(%error, "Failed to mint hostname");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed")
          }
        }
      }
      _ => respond(StatusCode::NOT_FOUND, "Not found"),
    }
  }

  #[tracing::instrument(skip_all, fields(role = "registrator", base = %self.base_host, addr = ?listener.local_addr().ok()))]
  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: ShutdownListener) -> anyhow::Result<()> {
    tracing::info!("Registrator started");
    serve_http(listener, shutdown, move |request| self.clone().handle(request)).await;
    tracing::info!("Registrator stopped");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::net::TcpListener;
  use tokio_util::sync::CancellationToken;

  use super::{Registration, Registrator};
  use crate::{
    common::authentication::{generate_signing_key, verify_token},
    util::unix_time_secs,
  };

  #[test]
  fn minted_tokens_verify_for_their_host() {
    let key = generate_signing_key();
    let registrator = Registrator::new("Tunnel.Example.com", key.clone());
    let first = registrator.mint().unwrap();
    let second = registrator.mint().unwrap();
    assert_ne!(first.host, second.host);
    assert!(first.host.ends_with(".tunnel.example.com"));
    let label = first.host.split('.').next().unwrap();
    assert_eq!(label.len(), 32);
    let access = verify_token(&key.verifying_key(), &first.token, unix_time_secs()).unwrap();
    assert_eq!(access.host, first.host);
    assert_eq!(access.expires_at, None);
  }

  #[tokio::test]
  async fn serves_registrations_over_http() {
    let key = generate_signing_key();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::task::spawn(
      Arc::new(Registrator::new("example.com", key.clone())).serve(listener, shutdown.clone().into()),
    );

    let client = reqwest::Client::new();
    let banner = client
      .get(format!("http://{}/", address))
      .send()
      .await
      .unwrap()
      .text()
      .await
      .unwrap();
    assert_eq!(banner, "opentunnel registrator");
    let registration: Registration = client
      .post(format!("http://{}/random", address))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
    assert!(verify_token(&key.verifying_key(), &registration.token, unix_time_secs()).is_ok());
    let missing = client.get(format!("http://{}/random", address)).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    shutdown.cancel();
    server.await.unwrap().unwrap();
  }
}
