// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-connection messages relayed between frontend and backend over the bus

use super::buffer::{BufferReader, BufferWriter, DecodeError, EncodeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerSocketMessage {
  Connected,
  Frame(Vec<u8>),
  Aborted,
}

impl InnerSocketMessage {
  pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
    let mut reader = BufferReader::new(buffer);
    match reader.read_u8()? {
      0 => Ok(InnerSocketMessage::Connected),
      1 => Ok(InnerSocketMessage::Frame(reader.read_short_bytes()?.to_vec())),
      2 => Ok(InnerSocketMessage::Aborted),
      unknown => Err(DecodeError::UnknownTag(unknown)),
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    let mut writer = BufferWriter::new();
    match self {
      InnerSocketMessage::Connected => {
        writer.append_u8(0);
      }
      InnerSocketMessage::Frame(frame) => {
        writer.append_u8(1).append_short_bytes(frame)?;
      }
      InnerSocketMessage::Aborted => {
        writer.append_u8(2);
      }
    }
    Ok(writer.build())
  }
}

#[cfg(test)]
mod tests {
  use super::InnerSocketMessage;
  use crate::common::protocol::buffer::DecodeError;

  #[test]
  fn variants_survive_encoding() {
    for message in [
      InnerSocketMessage::Connected,
      InnerSocketMessage::Frame(b"hello".to_vec()),
      InnerSocketMessage::Frame(Vec::new()),
      InnerSocketMessage::Aborted,
    ] {
      assert_eq!(InnerSocketMessage::decode(&message.encode().unwrap()), Ok(message));
    }
  }

  #[test]
  fn malformed_input_is_unrecognized() {
    assert_eq!(InnerSocketMessage::decode(&[3]), Err(DecodeError::UnknownTag(3)));
    assert!(InnerSocketMessage::decode(&[1, 0, 4, 1, 2]).is_err());
    assert!(InnerSocketMessage::decode(&[]).is_err());
  }
}
