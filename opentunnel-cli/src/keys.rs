// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use opentunnel::{
  common::authentication::{
    encode_signing_key, encode_verifying_key, generate_signing_key, parse_signing_key, sign_token, SigningKey,
  },
  util::unix_time_secs,
};
use std::path::PathBuf;

/// Base64 ed25519 secret used to mint access tokens
pub const SIGNING_KEY_VAR: &str = "OPENTUNNEL_SIGNING_KEY";

pub fn signing_key_from_env() -> Result<SigningKey> {
  let encoded = std::env::var(SIGNING_KEY_VAR)
    .with_context(|| format!("{} must hold the relay's signing key", SIGNING_KEY_VAR))?;
  parse_signing_key(encoded.trim()).with_context(|| format!("{} is not a valid signing key", SIGNING_KEY_VAR))
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct KeygenArgs {
  /// Where to write the secret key; printed instead when absent
  pub output: Option<PathBuf>,
}

#[tracing::instrument(skip_all)]
pub async fn keygen_main(args: KeygenArgs) -> Result<()> {
  let key = generate_signing_key();
  let public = encode_verifying_key(&key.verifying_key());
  let secret = encode_signing_key(&key);
  match args.output {
    Some(path) => {
      if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
          .await
          .context("Key directory creation must succeed")?;
      }
      tokio::fs::write(&path, format!("{}\n", secret))
        .await
        .with_context(|| format!("Failed writing secret key to {}", path.display()))?;
      tracing::info!(path = %path.display(), "Secret key written");
      println!("public: {}", public);
    }
    None => {
      println!("public: {}", public);
      println!("secret: {}", secret);
    }
  }
  Ok(())
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct TokenArgs {
  pub host: String,
  pub expires_at: Option<u32>,
}

pub async fn token_main(args: TokenArgs) -> Result<()> {
  let key = signing_key_from_env()?;
  if let Some(expires_at) = args.expires_at {
    if u64::from(expires_at) < unix_time_secs() {
      tracing::warn!(expires_at, "Minting a token that has already expired");
    }
  }
  let token = sign_token(&key, &args.host, args.expires_at).context("Token could not be signed")?;
  println!("{}", token);
  Ok(())
}
