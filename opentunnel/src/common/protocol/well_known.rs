// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::buffer::{BufferReader, BufferWriter, DecodeError, EncodeError};

/// Reply to a `wk-{socketId}` request; `None` when the client had nothing to serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WellKnownReply(pub Option<Vec<u8>>);

impl WellKnownReply {
  pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
    let mut reader = BufferReader::new(buffer);
    match reader.read_u8()? {
      0 => Ok(Self(None)),
      _ => Ok(Self(Some(reader.read_short_bytes()?.to_vec()))),
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    let mut writer = BufferWriter::new();
    match &self.0 {
      None => {
        writer.append_u8(0);
      }
      Some(content) => {
        writer.append_u8(1).append_short_bytes(content)?;
      }
    }
    Ok(writer.build())
  }
}
