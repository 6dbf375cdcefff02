// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Recovers the requested hostname from the first bytes of a TLS connection
//!
//! Only the ClientHello is inspected; the handshake itself is never completed,
//! so the relay can route encrypted traffic it cannot read.

use super::protocol::buffer::{BufferReader, DecodeError};

const RECORD_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;
const RANDOM_LENGTH: usize = 32;
const MAX_SESSION_ID_LENGTH: usize = 32;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerNameError {
  #[error("Connection did not open with a TLS handshake record")]
  NotTls,
  #[error("Handshake message was not a ClientHello")]
  NotClientHello,
  #[error("ClientHello ended before the server name could be read")]
  Truncated,
  #[error("ClientHello was malformed")]
  Malformed,
  #[error("ClientHello carried no server name")]
  NoServerName,
  #[error("Server name ended with a dot")]
  TrailingDot,
}

impl ServerNameError {
  /// The bytes seen so far cannot be judged, as opposed to being an invalid ClientHello
  ///
  /// Connections are closed in either case; the distinction is for logging.
  pub fn is_indeterminate(&self) -> bool {
    matches!(self, ServerNameError::NotTls | ServerNameError::Truncated)
  }
}

impl From<DecodeError> for ServerNameError {
  fn from(error: DecodeError) -> Self {
    match error {
      DecodeError::UnexpectedEnd { .. } => ServerNameError::Truncated,
      DecodeError::UnknownTag(_) | DecodeError::NonAscii => ServerNameError::Malformed,
    }
  }
}

/// Extracts the lowercased SNI hostname from the first data chunk of a connection
pub fn extract_server_name(buffer: &[u8]) -> Result<String, ServerNameError> {
  let mut reader = BufferReader::new(buffer);

  // Record header: type, version, length
  if reader.read_u8().map_err(|_| ServerNameError::NotTls)? != RECORD_TYPE_HANDSHAKE {
    return Err(ServerNameError::NotTls);
  }
  let major_version = reader.read_u8().map_err(|_| ServerNameError::NotTls)?;
  if major_version < 3 {
    return Err(ServerNameError::NotTls);
  }
  reader.read_u8()?;
  reader.read_u16()?;

  // Handshake header: type, 24-bit length
  if reader.read_u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
    return Err(ServerNameError::NotClientHello);
  }
  reader.read_bytes(3)?;

  // ClientHello body
  reader.read_u16()?;
  reader.read_bytes(RANDOM_LENGTH)?;
  let session_id_length = reader.read_u8()? as usize;
  if session_id_length > MAX_SESSION_ID_LENGTH {
    return Err(ServerNameError::Malformed);
  }
  reader.read_bytes(session_id_length)?;
  let cipher_suites_length = reader.read_u16()? as usize;
  if cipher_suites_length % 2 != 0 {
    return Err(ServerNameError::Malformed);
  }
  reader.read_bytes(cipher_suites_length)?;
  let compression_methods_length = reader.read_u8()? as usize;
  reader.read_bytes(compression_methods_length)?;

  if reader.remaining() == 0 {
    return Err(ServerNameError::NoServerName);
  }
  let extensions = reader.read_short_bytes()?;
  // The extensions block closes the ClientHello; anything after it means a bad length
  if reader.remaining() != 0 {
    return Err(ServerNameError::Malformed);
  }
  let mut extensions = BufferReader::new(extensions);
  while extensions.remaining() > 0 {
    let extension_type = extensions.read_u16()?;
    let extension_data = extensions.read_short_bytes()?;
    if extension_type == EXTENSION_SERVER_NAME {
      return parse_server_name_extension(extension_data);
    }
  }
  Err(ServerNameError::NoServerName)
}

fn parse_server_name_extension(data: &[u8]) -> Result<String, ServerNameError> {
  let mut data = BufferReader::new(data);
  let list = data.read_short_bytes().map_err(|_| ServerNameError::Malformed)?;
  let mut list = BufferReader::new(list);
  while list.remaining() > 0 {
    let name_type = list.read_u8().map_err(|_| ServerNameError::Malformed)?;
    let name = list
      .read_short_bytes()
      .map_err(|_| ServerNameError::Malformed)?;
    if name_type != NAME_TYPE_HOST_NAME {
      continue;
    }
    if name.is_empty() || !name.is_ascii() {
      return Err(ServerNameError::Malformed);
    }
    if name.ends_with(b".") {
      return Err(ServerNameError::TrailingDot);
    }
    return Ok(
      name
        .iter()
        .map(|b| b.to_ascii_lowercase() as char)
        .collect(),
    );
  }
  Err(ServerNameError::NoServerName)
}

#[cfg(test)]
pub(crate) mod tests {
  use super::{extract_server_name, ServerNameError};

  fn u16_prefixed(body: &[u8]) -> Vec<u8> {
    let mut out = (body.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
  }

  fn extension(kind: u16, body: &[u8]) -> Vec<u8> {
    let mut out = kind.to_be_bytes().to_vec();
    out.extend(u16_prefixed(body));
    out
  }

  fn server_name_extension(entries: &[(u8, &[u8])]) -> Vec<u8> {
    let mut list = Vec::new();
    for (kind, name) in entries {
      list.push(*kind);
      list.extend(u16_prefixed(name));
    }
    extension(0, &u16_prefixed(&list))
  }

  /// Builds a TLS 1.2-framed ClientHello carrying the given extensions
  pub(crate) fn client_hello_with_extensions(extensions: Option<Vec<u8>>) -> Vec<u8> {
    let mut body = vec![3, 3];
    body.extend([0x5a; 32]);
    body.push(32);
    body.extend([0x11; 32]);
    body.extend(u16_prefixed(&[0x13, 0x01, 0x13, 0x02, 0xc0, 0x2f]));
    body.extend([1, 0]);
    if let Some(extensions) = extensions {
      body.extend(u16_prefixed(&extensions));
    }
    let mut handshake = vec![1];
    handshake.extend(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend(body);
    let mut record = vec![22, 3, 1];
    record.extend(u16_prefixed(&handshake));
    record
  }

  pub(crate) fn client_hello(server_name: &str) -> Vec<u8> {
    let mut extensions = extension(0x000a, &[0, 2, 0, 0x1d]);
    extensions.extend(server_name_extension(&[(0, server_name.as_bytes())]));
    extensions.extend(extension(0x002b, &[2, 3, 4]));
    client_hello_with_extensions(Some(extensions))
  }

  #[test]
  fn finds_the_server_name() {
    for host in ["a.example.com", "x", "deeply.nested.sub.domain.example.org"] {
      assert_eq!(extract_server_name(&client_hello(host)).as_deref(), Ok(host));
    }
  }

  #[test]
  fn server_names_are_lowercased() {
    assert_eq!(
      extract_server_name(&client_hello("A.Example.COM")).as_deref(),
      Ok("a.example.com")
    );
  }

  #[test]
  fn first_host_name_entry_wins() {
    let extensions = server_name_extension(&[(7, b"ignored"), (0, b"first.example"), (0, b"second.example")]);
    assert_eq!(
      extract_server_name(&client_hello_with_extensions(Some(extensions))).as_deref(),
      Ok("first.example")
    );
  }

  #[test]
  fn every_truncation_is_rejected() {
    let hello = client_hello("a.example.com");
    for length in 0..hello.len() {
      assert!(
        extract_server_name(&hello[..length]).is_err(),
        "prefix of {} bytes must not yield a hostname",
        length
      );
    }
  }

  #[test]
  fn missing_extensions_yield_no_server_name() {
    assert_eq!(
      extract_server_name(&client_hello_with_extensions(None)),
      Err(ServerNameError::NoServerName)
    );
    let unrelated = extension(0x000a, &[0, 2, 0, 0x1d]);
    assert_eq!(
      extract_server_name(&client_hello_with_extensions(Some(unrelated))),
      Err(ServerNameError::NoServerName)
    );
  }

  #[test]
  fn non_tls_input_is_indeterminate() {
    let error = extract_server_name(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n").unwrap_err();
    assert_eq!(error, ServerNameError::NotTls);
    assert!(error.is_indeterminate());
    let mut sslv2 = client_hello("a.example.com");
    sslv2[1] = 2;
    assert_eq!(extract_server_name(&sslv2), Err(ServerNameError::NotTls));
  }

  #[test]
  fn malformed_hellos_are_rejected() {
    let mut server_hello = client_hello("a.example.com");
    server_hello[5] = 2;
    assert_eq!(
      extract_server_name(&server_hello),
      Err(ServerNameError::NotClientHello)
    );
    assert_eq!(
      extract_server_name(&client_hello("a.example.com.")),
      Err(ServerNameError::TrailingDot)
    );
    let overlong_entry = {
      let mut list = vec![0u8, 0, 200];
      list.extend(b"short");
      extension(0, &u16_prefixed(&list))
    };
    let error = extract_server_name(&client_hello_with_extensions(Some(overlong_entry))).unwrap_err();
    assert_eq!(error, ServerNameError::Malformed);
    assert!(!error.is_indeterminate());
  }

  #[test]
  fn odd_cipher_suite_lengths_are_malformed() {
    let mut hello = client_hello("a.example.com");
    // cipher suite length lives after record(5) + handshake(4) + version(2) + random(32) + session id(33)
    let offset = 5 + 4 + 2 + 32 + 33;
    hello[offset + 1] = 5;
    assert_eq!(extract_server_name(&hello), Err(ServerNameError::Malformed));
  }

  #[test]
  fn oversized_session_ids_are_malformed() {
    let mut hello = client_hello("a.example.com");
    // session id length follows record(5) + handshake(4) + version(2) + random(32)
    let offset = 5 + 4 + 2 + 32;
    assert_eq!(hello[offset], 32);
    hello[offset] = 33;
    assert_eq!(extract_server_name(&hello), Err(ServerNameError::Malformed));
  }

  #[test]
  fn extensions_must_fill_the_remaining_bytes() {
    let mut hello = client_hello("a.example.com");
    hello.extend([0, 0, 0, 0]);
    assert_eq!(extract_server_name(&hello), Err(ServerNameError::Malformed));
  }
}
