// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Cursor-style reader and writer for the big-endian wire encodings
//!
//! Variable-length fields are always preceded by an explicit length; the
//! reader refuses any stated length that runs past the end of its buffer.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
  #[error("Unexpected end of message; wanted {wanted} bytes at offset {offset}")]
  UnexpectedEnd { wanted: usize, offset: usize },
  #[error("Unrecognized message tag {0}")]
  UnknownTag(u8),
  #[error("Identifier was not ASCII")]
  NonAscii,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
  #[error("Field of {length} bytes exceeds the {limit}-byte limit of its length prefix")]
  TooLong { length: usize, limit: usize },
  #[error("Identifier was not ASCII")]
  NonAscii,
}

pub struct BufferReader<'a> {
  buffer: &'a [u8],
  offset: usize,
}

impl<'a> BufferReader<'a> {
  pub fn new(buffer: &'a [u8]) -> Self {
    Self { buffer, offset: 0 }
  }

  pub fn remaining(&self) -> usize {
    self.buffer.len() - self.offset
  }

  pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8], DecodeError> {
    if length > self.remaining() {
      return Err(DecodeError::UnexpectedEnd {
        wanted: length,
        offset: self.offset,
      });
    }
    let slice = &self.buffer[self.offset..self.offset + length];
    self.offset += length;
    Ok(slice)
  }

  pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
    Ok(self.read_bytes(1)?[0])
  }

  pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
    let bytes = self.read_bytes(2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
  }

  pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
    let bytes = self.read_bytes(4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
  }

  pub fn read_ascii(&mut self, length: usize) -> Result<String, DecodeError> {
    let bytes = self.read_bytes(length)?;
    if !bytes.is_ascii() {
      return Err(DecodeError::NonAscii);
    }
    Ok(bytes.iter().map(|&b| b as char).collect())
  }

  /// A `u16` length followed by that many bytes
  pub fn read_short_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
    let length = self.read_u16()? as usize;
    self.read_bytes(length)
  }

  /// A `u16` length followed by that many ASCII characters
  pub fn read_short_ascii(&mut self) -> Result<String, DecodeError> {
    let length = self.read_u16()? as usize;
    self.read_ascii(length)
  }
}

#[derive(Debug, Default)]
pub struct BufferWriter {
  buffer: Vec<u8>,
}

impl BufferWriter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn append_u8(&mut self, value: u8) -> &mut Self {
    self.buffer.push(value);
    self
  }

  pub fn append_u16(&mut self, value: u16) -> &mut Self {
    self.buffer.extend_from_slice(&value.to_be_bytes());
    self
  }

  pub fn append_u32(&mut self, value: u32) -> &mut Self {
    self.buffer.extend_from_slice(&value.to_be_bytes());
    self
  }

  pub fn append_bytes(&mut self, value: &[u8]) -> &mut Self {
    self.buffer.extend_from_slice(value);
    self
  }

  pub fn append_short_bytes(&mut self, value: &[u8]) -> Result<&mut Self, EncodeError> {
    let length = u16::try_from(value.len()).map_err(|_| EncodeError::TooLong {
      length: value.len(),
      limit: u16::MAX as usize,
    })?;
    Ok(self.append_u16(length).append_bytes(value))
  }

  pub fn append_short_ascii(&mut self, value: &str) -> Result<&mut Self, EncodeError> {
    if !value.is_ascii() {
      return Err(EncodeError::NonAscii);
    }
    self.append_short_bytes(value.as_bytes())
  }

  pub fn build(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buffer)
  }
}
