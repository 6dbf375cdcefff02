// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Length-prefixed framing for the client ⇄ backend physical link
//!
//! Every frame is a big-endian `u32` length followed by that many bytes;
//! one frame carries exactly one client-protocol message.

use futures::{
  future,
  stream::{self, BoxStream, StreamExt},
};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt},
  sync::mpsc,
  task::JoinHandle,
};

/// Largest frame accepted from a peer unless configured otherwise
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

impl ReadError {
  /// A clean close between frames, as opposed to a truncated or oversized frame
  pub fn is_clean_close(&self) -> bool {
    matches!(
      self,
      ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      } if error.kind() == ::std::io::ErrorKind::UnexpectedEof
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  #[error("Frame of {0} bytes cannot be length-prefixed")]
  TooLong(usize),
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), WriteError> {
  let length = u32::try_from(buffer.len()).map_err(|_| WriteError::TooLong(buffer.len()))?;
  s.write_u32(length).await?;
  Ok(s.write_all(buffer).await?)
}

/// Turns a reader into a stream of frames
///
/// The stream ends silently on a clean close between frames; any other
/// failure is yielded once, after which the stream ends.
pub fn frame_stream<R>(reader: R, max_length: Option<usize>) -> BoxStream<'static, Result<Vec<u8>, ReadError>>
where
  R: AsyncRead + Send + Unpin + 'static,
{
  stream::unfold(Some(reader), move |reader| async move {
    let mut reader = reader?;
    match read_frame(&mut reader, max_length).await {
      Ok(frame) => Some((Ok(frame), Some(reader))),
      Err(error) if error.is_clean_close() => None,
      Err(error) => Some((Err(error), None)),
    }
  })
  .boxed()
}

/// Cloneable handle queueing frames onto a [FramedTransport]'s writer task
#[derive(Debug, Clone)]
pub struct FrameSender {
  queue: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Outer transport is closed")]
pub struct TransportClosed;

impl FrameSender {
  pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportClosed> {
    self.queue.send(frame).map_err(|_| TransportClosed)
  }

  pub fn is_closed(&self) -> bool {
    self.queue.is_closed()
  }
}

/// A duplex byte stream split into an inbound frame stream and a queued outbound writer
pub struct FramedTransport {
  incoming: BoxStream<'static, Result<Vec<u8>, ReadError>>,
  sender: FrameSender,
  writer: JoinHandle<Result<(), WriteError>>,
}

impl FramedTransport {
  pub fn new<S>(stream: S, max_length: Option<usize>) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (reader, mut writer) = tokio::io::split(stream);
    let (queue, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::task::spawn(async move {
      while let Some(frame) = outbound.recv().await {
        write_frame(&mut writer, &frame).await?;
      }
      writer.shutdown().await?;
      Ok(())
    });
    Self {
      incoming: frame_stream(reader, max_length),
      sender: FrameSender { queue },
      writer,
    }
  }

  pub fn sender(&self) -> FrameSender {
    self.sender.clone()
  }

  /// Next inbound frame; `None` once the peer has closed the link
  pub async fn next_frame(&mut self) -> Option<Result<Vec<u8>, ReadError>> {
    self.incoming.next().await
  }

  /// Split into parts, for owners that poll reading and writing from separate branches
  pub fn into_parts(
    self,
  ) -> (
    BoxStream<'static, Result<Vec<u8>, ReadError>>,
    FrameSender,
    JoinHandle<Result<(), WriteError>>,
  ) {
    (self.incoming, self.sender, self.writer)
  }

  /// Tears down both directions immediately, discarding any queued frames
  pub fn close(self) {
    self.writer.abort();
  }
}

/// Resolves when the writer task has ended; pending forever if there is none
pub async fn writer_ended(writer: &mut Option<JoinHandle<Result<(), WriteError>>>) {
  match writer {
    Some(handle) => {
      let _ = handle.await;
      *writer = None;
    }
    None => future::pending::<()>().await,
  }
}
