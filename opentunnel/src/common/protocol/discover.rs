// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::buffer::{BufferReader, BufferWriter, DecodeError, EncodeError};

/// Reply to a `discover-{host}` request naming the backend socket serving the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverReply {
  pub backend_id: String,
  pub socket_id: String,
}

impl DiscoverReply {
  pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
    let mut reader = BufferReader::new(buffer);
    Ok(Self {
      backend_id: reader.read_short_ascii()?,
      socket_id: reader.read_short_ascii()?,
    })
  }

  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    Ok(
      BufferWriter::new()
        .append_short_ascii(&self.backend_id)?
        .append_short_ascii(&self.socket_id)?
        .build(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::DiscoverReply;

  #[test]
  fn backend_precedes_socket() {
    let reply = DiscoverReply {
      backend_id: "b".into(),
      socket_id: "sock".into(),
    };
    let encoded = reply.encode().unwrap();
    assert_eq!(encoded, [0u8, 1, b'b', 0, 4, b's', b'o', b'c', b'k']);
    assert_eq!(DiscoverReply::decode(&encoded), Ok(reply));
    assert!(DiscoverReply::decode(&encoded[..4]).is_err());
  }
}
