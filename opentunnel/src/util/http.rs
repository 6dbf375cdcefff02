// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Minimal HTTP/1 serving for the relay's auxiliary endpoints

use std::{convert::Infallible, future::Future, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing_futures::Instrument;

use super::cancellation::ShutdownListener;

pub type HttpResponse = Response<Full<Bytes>>;

pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
  let mut response = Response::new(Full::new(body.into()));
  *response.status_mut() = status;
  response
}

/// `Host` header without any port suffix, lowercased
pub fn request_host<B>(request: &Request<B>) -> Option<String> {
  let host = request
    .headers()
    .get(hyper::header::HOST)
    .and_then(|value| value.to_str().ok())
    .or_else(|| request.uri().host())?;
  let host = match host.rsplit_once(':') {
    Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
    _ => host,
  };
  Some(host.to_ascii_lowercase())
}

/// Serves every accepted connection with `handler` until shutdown
pub async fn serve_http<H, Fut>(listener: TcpListener, shutdown: ShutdownListener, handler: H)
where
  H: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = HttpResponse> + Send + 'static,
{
  let handler = Arc::new(handler);
  loop {
    let (stream, peer) = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok(accepted) => accepted,
        Err(error) => {
          tracing::warn!(%error, "Failed to accept HTTP connection");
          continue;
        }
      },
    };
    let handler = handler.clone();
    let connection_shutdown = shutdown.clone();
    tokio::task::spawn(
      async move {
        let service = service_fn(move |request: Request<Incoming>| {
          let handler = handler.clone();
          async move { Ok::<_, Infallible>(handler(request).await) }
        });
        let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);
        tokio::select! {
          result = connection.as_mut() => {
            if let Err(error) = result {
              tracing::debug!(%error, "HTTP connection error");
            }
          }
          _ = connection_shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            let _ = connection.await;
          }
        }
      }
      .instrument(tracing::trace_span!("http", %peer)),
    );
  }
}

#[cfg(test)]
mod tests {
  use hyper::Request;

  use super::request_host;

  #[test]
  fn host_headers_lose_their_port() {
    let request = Request::builder()
      .uri("/x")
      .header("host", "A.Example.com:8080")
      .body(())
      .unwrap();
    assert_eq!(request_host(&request).as_deref(), Some("a.example.com"));
    let bare = Request::builder().uri("/x").header("host", "b.example.com").body(()).unwrap();
    assert_eq!(request_host(&bare).as_deref(), Some("b.example.com"));
    let missing = Request::builder().uri("/x").body(()).unwrap();
    assert_eq!(request_host(&missing), None);
  }
}
