// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::registrator::Registration;

#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
  #[error("Registrator request failed: {0}")]
  Http(#[from] reqwest::Error),
  #[error("Registrator answered {0}")]
  Status(reqwest::StatusCode),
}

/// Allocates a public hostname and its access token
pub trait HostnameRegistrar: Send + Sync {
  fn register(&self) -> BoxFuture<'static, Result<Registration, RegistrationError>>;
}

/// Registers against a registrator's `POST /random` endpoint
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
  client: reqwest::Client,
  base_url: String,
}

impl HttpRegistrar {
  pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

  pub fn new(base_url: impl Into<String>) -> Self {
    Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
  }

  pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
    Self {
      client: reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
    }
  }
}

impl HostnameRegistrar for HttpRegistrar {
  fn register(&self) -> BoxFuture<'static, Result<Registration, RegistrationError>> {
    let request = self.client.post(format!("{}/random", self.base_url));
    async move {
      let response = request.send().await?;
      if !response.status().is_success() {
        return Err(RegistrationError::Status(response.status()));
      }
      Ok(response.json::<Registration>().await?)
    }
    .boxed()
  }
}
