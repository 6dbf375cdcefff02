// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Signed access tokens binding a client to the hostname it may serve
//!
//! A token is `base64(signature || message)` where the message is
//! `u16 hostLength, host, u32 expiry` and expiry is in unix seconds, zero
//! meaning the token never expires.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, Verifier, SIGNATURE_LENGTH};
pub use ed25519_dalek::{SigningKey, VerifyingKey};
use futures::future::{BoxFuture, FutureExt};

use super::protocol::buffer::{BufferReader, BufferWriter, DecodeError, EncodeError};
use crate::util::unix_time_secs;

/// Hostnames under these prefixes belong to the relay's own infrastructure
pub const RESERVED_HOST_PREFIXES: &[&str] = &["backhaul.", "registrator.", "api."];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
  #[error("Token is not valid base64")]
  Encoding,
  #[error("Token is too short to carry a signature")]
  MissingSignature,
  #[error("Token signature does not match")]
  BadSignature,
  #[error("Token body is malformed: {0}")]
  Malformed(#[from] DecodeError),
  #[error("Token host cannot be encoded: {0}")]
  Unencodable(#[from] EncodeError),
  #[error("Token expired at {expired_at}")]
  Expired { expired_at: u32 },
  #[error("Host {0:?} is reserved")]
  ReservedHost(String),
  #[error("Key material is invalid: {0}")]
  InvalidKey(String),
}

/// A verified claim to serve a hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
  pub host: String,
  /// Unix seconds, or `None` for tokens that never expire
  pub expires_at: Option<u32>,
}

fn is_reserved(host: &str) -> bool {
  let host = host.to_ascii_lowercase();
  RESERVED_HOST_PREFIXES
    .iter()
    .any(|prefix| host.starts_with(prefix))
}

pub fn sign_token(key: &SigningKey, host: &str, expires_at: Option<u32>) -> Result<String, TokenError> {
  if is_reserved(host) {
    return Err(TokenError::ReservedHost(host.to_string()));
  }
  let mut writer = BufferWriter::new();
  writer
    .append_short_ascii(host)?
    .append_u32(expires_at.unwrap_or(0));
  let message = writer.build();
  let signature = key.sign(&message);
  let mut token = Vec::with_capacity(SIGNATURE_LENGTH + message.len());
  token.extend_from_slice(&signature.to_bytes());
  token.extend_from_slice(&message);
  Ok(STANDARD.encode(token))
}

pub fn verify_token(key: &VerifyingKey, token: &str, now: u64) -> Result<AccessToken, TokenError> {
  let token = STANDARD
    .decode(token.trim())
    .map_err(|_| TokenError::Encoding)?;
  if token.len() < SIGNATURE_LENGTH {
    return Err(TokenError::MissingSignature);
  }
  let (signature, message) = token.split_at(SIGNATURE_LENGTH);
  let signature: [u8; SIGNATURE_LENGTH] = signature
    .try_into()
    .map_err(|_| TokenError::MissingSignature)?;
  key
    .verify(message, &Signature::from_bytes(&signature))
    .map_err(|_| TokenError::BadSignature)?;
  let mut reader = BufferReader::new(message);
  let host = reader.read_short_ascii()?.to_ascii_lowercase();
  let expiry = reader.read_u32()?;
  if expiry != 0 && u64::from(expiry) < now {
    return Err(TokenError::Expired { expired_at: expiry });
  }
  Ok(AccessToken {
    host,
    expires_at: Some(expiry).filter(|e| *e != 0),
  })
}

pub fn generate_signing_key() -> SigningKey {
  SigningKey::generate(&mut rand::rngs::OsRng)
}

pub fn encode_signing_key(key: &SigningKey) -> String {
  STANDARD.encode(key.to_bytes())
}

pub fn encode_verifying_key(key: &VerifyingKey) -> String {
  STANDARD.encode(key.as_bytes())
}

/// Accepts a base64 32-byte seed, or the 64-byte `seed || public` form
pub fn parse_signing_key(encoded: &str) -> Result<SigningKey, TokenError> {
  let bytes = STANDARD
    .decode(encoded.trim())
    .map_err(|_| TokenError::InvalidKey("not base64".into()))?;
  let seed: [u8; 32] = match bytes.len() {
    32 | 64 => bytes[..32]
      .try_into()
      .map_err(|_| TokenError::InvalidKey("bad seed".into()))?,
    other => return Err(TokenError::InvalidKey(format!("{} bytes is not a key length", other))),
  };
  let key = SigningKey::from_bytes(&seed);
  if bytes.len() == 64 && key.verifying_key().as_bytes()[..] != bytes[32..] {
    return Err(TokenError::InvalidKey("public half does not match the seed".into()));
  }
  Ok(key)
}

pub fn parse_verifying_key(encoded: &str) -> Result<VerifyingKey, TokenError> {
  let bytes = STANDARD
    .decode(encoded.trim())
    .map_err(|_| TokenError::InvalidKey("not base64".into()))?;
  let bytes: [u8; 32] = bytes
    .as_slice()
    .try_into()
    .map_err(|_| TokenError::InvalidKey(format!("{} bytes is not a public key length", bytes.len())))?;
  VerifyingKey::from_bytes(&bytes).map_err(|e| TokenError::InvalidKey(e.to_string()))
}

/// Decides which hostname, if any, the holder of a handshake credential may serve
pub trait AuthenticationHandler: std::fmt::Debug + Send + Sync {
  fn authenticate(&self, credentials: Vec<u8>) -> BoxFuture<'static, Result<AccessToken, TokenError>>;
}

/// Accepts tokens signed by a single relay key
#[derive(Debug, Clone)]
pub struct SignedTokenAuthenticator {
  key: VerifyingKey,
}

impl SignedTokenAuthenticator {
  pub fn new(key: VerifyingKey) -> Self {
    Self { key }
  }
}

impl AuthenticationHandler for SignedTokenAuthenticator {
  fn authenticate(&self, credentials: Vec<u8>) -> BoxFuture<'static, Result<AccessToken, TokenError>> {
    let key = self.key;
    async move {
      let token = std::str::from_utf8(&credentials).map_err(|_| TokenError::Encoding)?;
      verify_token(&key, token, unix_time_secs())
    }
    .boxed()
  }
}
