// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Persistence for the managed tunnel's hostname, certificate, and ACME account

use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt};

use super::certificates::CertificateBundle;
use crate::registrator::Registration;

pub const DEFAULT_STATE_DIR: &str = ".opentunnel";

const CONFIG_FILE: &str = "config.json";
const PRIVATE_KEY_FILE: &str = "privatekey.pem";
const CERTIFICATE_FILE: &str = "certificate.pem";
const CHAIN_FILE: &str = "chain.pem";
const ACCOUNT_FILE: &str = "account.pem";

#[derive(thiserror::Error, Debug)]
pub enum StateError {
  #[error("State storage failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Stored configuration is malformed: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedState {
  pub registration: Option<Registration>,
  pub certificate: Option<CertificateBundle>,
  pub account_key: Option<String>,
}

/// Loaded once at startup; each hook is called whenever the corresponding material changes
pub trait StateStore: Send + Sync {
  fn load(&self) -> BoxFuture<'static, Result<ManagedState, StateError>>;

  fn hostname_registered(&self, registration: &Registration) -> BoxFuture<'static, Result<(), StateError>>;

  fn certificate_updated(&self, certificate: &CertificateBundle) -> BoxFuture<'static, Result<(), StateError>>;

  fn account_key_created(&self, account_key: &str) -> BoxFuture<'static, Result<(), StateError>>;
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
  directory: PathBuf,
}

impl Default for FileStateStore {
  fn default() -> Self {
    Self::new(DEFAULT_STATE_DIR)
  }
}

async fn read_optional(path: PathBuf) -> Result<Option<String>, StateError> {
  match tokio::fs::read_to_string(&path).await {
    Ok(content) => Ok(Some(content)),
    Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(error) => Err(error.into()),
  }
}

async fn write_all(directory: PathBuf, files: Vec<(&'static str, String)>) -> Result<(), StateError> {
  tokio::fs::create_dir_all(&directory).await?;
  for (name, content) in files {
    tokio::fs::write(directory.join(name), content).await?;
  }
  Ok(())
}

impl FileStateStore {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }
}

impl StateStore for FileStateStore {
  fn load(&self) -> BoxFuture<'static, Result<ManagedState, StateError>> {
    let directory = self.directory.clone();
    async move {
      let registration = match read_optional(directory.join(CONFIG_FILE)).await? {
        Some(config) => Some(serde_json::from_str::<Registration>(&config)?),
        None => None,
      };
      let private_key = read_optional(directory.join(PRIVATE_KEY_FILE)).await?;
      let certificate = read_optional(directory.join(CERTIFICATE_FILE)).await?;
      let chain = read_optional(directory.join(CHAIN_FILE)).await?;
      let certificate = match (private_key, certificate) {
        (Some(private_key), Some(certificate)) => Some(CertificateBundle {
          private_key,
          certificate,
          chain: chain.unwrap_or_default(),
        }),
        _ => None,
      };
      let account_key = read_optional(directory.join(ACCOUNT_FILE)).await?;
      tracing::debug!(
        directory = %directory.display(),
        registered = registration.is_some(),
        certificate = certificate.is_some(),
        "Loaded persisted state"
      );
      Ok(ManagedState {
        registration,
        certificate,
        account_key,
      })
    }
    .boxed()
  }

  fn hostname_registered(&self, registration: &Registration) -> BoxFuture<'static, Result<(), StateError>> {
    let config = serde_json::to_string_pretty(registration);
    let directory = self.directory.clone();
    async move { write_all(directory, vec![(CONFIG_FILE, config?)]).await }.boxed()
  }

  fn certificate_updated(&self, certificate: &CertificateBundle) -> BoxFuture<'static, Result<(), StateError>> {
    let files = vec![
      (PRIVATE_KEY_FILE, certificate.private_key.clone()),
      (CERTIFICATE_FILE, certificate.certificate.clone()),
      (CHAIN_FILE, certificate.chain.clone()),
    ];
    write_all(self.directory.clone(), files).boxed()
  }

  fn account_key_created(&self, account_key: &str) -> BoxFuture<'static, Result<(), StateError>> {
    write_all(self.directory.clone(), vec![(ACCOUNT_FILE, account_key.to_string())]).boxed()
  }
}
