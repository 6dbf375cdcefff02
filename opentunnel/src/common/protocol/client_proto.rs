// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Messages exchanged between a client and the relay over the physical link

use super::buffer::{BufferReader, BufferWriter, DecodeError, EncodeError};

const TAG_CONNECTED: u8 = 0;
const TAG_FRAME: u8 = 1;
const TAG_ABORTED: u8 = 2;
const TAG_WELL_KNOWN_REQUEST: u8 = 3;
const TAG_WELL_KNOWN_RESPONSE: u8 = 4;
const TAG_KEEP_ALIVE: u8 = 5;

const TAG_HANDSHAKE: u8 = 0;

/// Largest payload one `Frame` can carry; longer reads must be chunked
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
  Connected { id: String },
  Frame { id: String, frame: Vec<u8> },
  Aborted { id: String },
  WellKnownRequest { request_id: String, path: String },
  WellKnownResponse {
    request_id: String,
    content: Option<Vec<u8>>,
  },
  KeepAlive,
}

impl ClientMessage {
  pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
    let mut reader = BufferReader::new(buffer);
    let message = match reader.read_u8()? {
      TAG_CONNECTED => ClientMessage::Connected {
        id: reader.read_short_ascii()?,
      },
      TAG_FRAME => ClientMessage::Frame {
        id: reader.read_short_ascii()?,
        frame: reader.read_short_bytes()?.to_vec(),
      },
      TAG_ABORTED => ClientMessage::Aborted {
        id: reader.read_short_ascii()?,
      },
      TAG_WELL_KNOWN_REQUEST => ClientMessage::WellKnownRequest {
        request_id: reader.read_short_ascii()?,
        path: reader.read_short_ascii()?,
      },
      TAG_WELL_KNOWN_RESPONSE => {
        let request_id = reader.read_short_ascii()?;
        let content = match reader.read_u8()? {
          0 => None,
          _ => Some(reader.read_short_bytes()?.to_vec()),
        };
        ClientMessage::WellKnownResponse {
          request_id,
          content,
        }
      }
      TAG_KEEP_ALIVE => ClientMessage::KeepAlive,
      unknown => return Err(DecodeError::UnknownTag(unknown)),
    };
    Ok(message)
  }

  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    let mut writer = BufferWriter::new();
    match self {
      ClientMessage::Connected { id } => {
        writer.append_u8(TAG_CONNECTED).append_short_ascii(id)?;
      }
      ClientMessage::Frame { id, frame } => {
        writer
          .append_u8(TAG_FRAME)
          .append_short_ascii(id)?
          .append_short_bytes(frame)?;
      }
      ClientMessage::Aborted { id } => {
        writer.append_u8(TAG_ABORTED).append_short_ascii(id)?;
      }
      ClientMessage::WellKnownRequest { request_id, path } => {
        writer
          .append_u8(TAG_WELL_KNOWN_REQUEST)
          .append_short_ascii(request_id)?
          .append_short_ascii(path)?;
      }
      ClientMessage::WellKnownResponse {
        request_id,
        content,
      } => {
        writer
          .append_u8(TAG_WELL_KNOWN_RESPONSE)
          .append_short_ascii(request_id)?;
        match content {
          None => {
            writer.append_u8(0);
          }
          Some(content) => {
            writer.append_u8(1).append_short_bytes(content)?;
          }
        }
      }
      ClientMessage::KeepAlive => {
        writer.append_u8(TAG_KEEP_ALIVE);
      }
    }
    Ok(writer.build())
  }

  /// The logical connection a message is addressed to, if any
  pub fn connection_id(&self) -> Option<&str> {
    match self {
      ClientMessage::Connected { id }
      | ClientMessage::Frame { id, .. }
      | ClientMessage::Aborted { id } => Some(id),
      _ => None,
    }
  }
}

/// Splits a payload into `Frame` messages no larger than the protocol allows
pub fn frames_for<'a>(id: &str, payload: &'a [u8]) -> impl Iterator<Item = ClientMessage> + 'a {
  let id = id.to_string();
  payload
    .chunks(MAX_FRAME_PAYLOAD)
    .map(move |chunk| ClientMessage::Frame {
      id: id.clone(),
      frame: chunk.to_vec(),
    })
}

/// First message on the physical link, carrying the client's access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshake {
  pub token: Vec<u8>,
}

impl ClientHandshake {
  pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
    let mut reader = BufferReader::new(buffer);
    match reader.read_u8()? {
      TAG_HANDSHAKE => Ok(Self {
        token: reader.read_short_bytes()?.to_vec(),
      }),
      unknown => Err(DecodeError::UnknownTag(unknown)),
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    Ok(
      BufferWriter::new()
        .append_u8(TAG_HANDSHAKE)
        .append_short_bytes(&self.token)?
        .build(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::{frames_for, ClientHandshake, ClientMessage, MAX_FRAME_PAYLOAD};
  use crate::common::protocol::buffer::DecodeError;

  #[test]
  fn every_variant_survives_encoding() {
    let messages = [
      ClientMessage::Connected { id: "c1".into() },
      ClientMessage::Frame {
        id: "c1".into(),
        frame: b"payload".to_vec(),
      },
      ClientMessage::Frame {
        id: "c1".into(),
        frame: Vec::new(),
      },
      ClientMessage::Aborted { id: "c1".into() },
      ClientMessage::WellKnownRequest {
        request_id: "r1".into(),
        path: "/acme-challenge/abc".into(),
      },
      ClientMessage::WellKnownResponse {
        request_id: "r1".into(),
        content: Some(b"key-authorization".to_vec()),
      },
      ClientMessage::WellKnownResponse {
        request_id: "r1".into(),
        content: None,
      },
      ClientMessage::KeepAlive,
    ];
    for message in messages {
      let encoded = message.encode().unwrap();
      assert_eq!(ClientMessage::decode(&encoded), Ok(message));
    }
  }

  #[test]
  fn layout_matches_the_wire_format() {
    let encoded = ClientMessage::Frame {
      id: "ab".into(),
      frame: vec![9, 8],
    }
    .encode()
    .unwrap();
    assert_eq!(encoded, [1u8, 0, 2, b'a', b'b', 0, 2, 9, 8]);
    assert_eq!(ClientMessage::KeepAlive.encode().unwrap(), [5u8]);
  }

  #[test]
  fn unknown_tags_and_truncation_are_rejected() {
    assert_eq!(ClientMessage::decode(&[42]), Err(DecodeError::UnknownTag(42)));
    assert!(ClientMessage::decode(&[]).is_err());
    assert!(ClientMessage::decode(&[1, 0, 2, b'a', b'b', 0, 5, 1]).is_err());
    assert!(ClientMessage::decode(&[4, 0, 1, b'r']).is_err());
  }

  #[test]
  fn large_payloads_are_chunked() {
    let payload = vec![3u8; MAX_FRAME_PAYLOAD * 2 + 10];
    let frames: Vec<_> = frames_for("c", &payload).collect();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.encode().is_ok()));
  }

  #[test]
  fn handshake_carries_the_token() {
    let handshake = ClientHandshake {
      token: b"signed".to_vec(),
    };
    let encoded = handshake.encode().unwrap();
    assert_eq!(&encoded[..3], &[0u8, 0, 6]);
    assert_eq!(ClientHandshake::decode(&encoded), Ok(handshake));
    assert!(ClientHandshake::decode(&[1, 0, 0]).is_err());
  }
}
