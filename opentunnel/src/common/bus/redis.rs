// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Cross-process bus over Redis pub/sub
//!
//! Redis messages carry no reply subject, so every payload is wrapped in an
//! envelope: `u16 replyLength, reply ascii, body`, with a zero length when
//! no reply is expected.

use std::{
  sync::{Arc, Weak},
  time::Duration,
};

use fred::prelude::*;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::{
  fanout::{RemoteSubscriptions, SubscriptionTable},
  request_via_inbox, Bus, BusError, BusMessage, Subscription,
};
use crate::{
  common::protocol::buffer::{BufferReader, BufferWriter, DecodeError},
  util::dropkick::Dropkick,
};

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RedisBusConfig {
  pub url: String,
}

impl Default for RedisBusConfig {
  fn default() -> Self {
    Self {
      url: "redis://127.0.0.1:6379".into(),
    }
  }
}

impl RedisBusConfig {
  pub fn with_url(url: impl Into<String>) -> Self {
    Self { url: url.into() }
  }
}

impl From<RedisError> for BusError {
  fn from(error: RedisError) -> Self {
    BusError::Transport(error.to_string())
  }
}

/// Channel membership of the dedicated subscriber connection
struct RedisChannels {
  client: RedisClient,
}

impl RemoteSubscriptions for RedisChannels {
  fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<(), BusError>> {
    let client = self.client.clone();
    let subject = subject.to_string();
    async move {
      let _: RedisValue = client.subscribe(subject.as_str()).await?;
      Ok(())
    }
    .boxed()
  }

  fn unsubscribe(&self, subject: &str) -> BoxFuture<'static, Result<(), BusError>> {
    let client = self.client.clone();
    let subject = subject.to_string();
    async move {
      let _: RedisValue = client.unsubscribe(subject.as_str()).await?;
      Ok(())
    }
    .boxed()
  }
}

#[derive(Clone)]
pub struct RedisBus {
  inner: Arc<RedisBusInner>,
}

struct RedisBusInner {
  publisher: RedisClient,
  subscriptions: Arc<SubscriptionTable<RedisChannels>>,
  _dispatch: Dropkick<CancellationToken>,
}

fn encode_envelope(message: &BusMessage) -> Result<Vec<u8>, BusError> {
  let mut writer = BufferWriter::new();
  writer
    .append_short_ascii(message.reply_to.as_deref().unwrap_or(""))
    .map_err(|e| BusError::Transport(e.to_string()))?
    .append_bytes(&message.payload);
  Ok(writer.build())
}

fn decode_envelope(subject: String, buffer: &[u8]) -> Result<BusMessage, DecodeError> {
  let mut reader = BufferReader::new(buffer);
  let reply_to = reader.read_short_ascii()?;
  let payload = reader.read_bytes(reader.remaining())?.to_vec();
  Ok(BusMessage {
    subject,
    payload,
    reply_to: Some(reply_to).filter(|r| !r.is_empty()),
  })
}

impl RedisBus {
  #[tracing::instrument(skip(config), fields(url = %config.url), err)]
  pub async fn connect(config: RedisBusConfig) -> Result<Self, BusError> {
    let redis_config = RedisConfig::from_url(&config.url)?;
    let publisher = RedisClient::new(redis_config.clone(), None, Some(ReconnectPolicy::default()));
    let subscriber = RedisClient::new(redis_config, None, Some(ReconnectPolicy::default()));
    let _ = publisher.connect();
    let _ = subscriber.connect();
    publisher.wait_for_connect().await?;
    subscriber.wait_for_connect().await?;

    let dispatch = CancellationToken::new();
    let inner = Arc::new(RedisBusInner {
      publisher,
      subscriptions: SubscriptionTable::new(RedisChannels { client: subscriber }),
      _dispatch: Dropkick::new(dispatch.clone()),
    });
    tokio::task::spawn(Self::dispatch(Arc::downgrade(&inner), dispatch));
    tracing::info!("Connected to redis bus");
    Ok(Self { inner })
  }

  async fn dispatch(inner: Weak<RedisBusInner>, stop: CancellationToken) {
    let (mut messages, mut reconnects) = match inner.upgrade() {
      Some(inner) => {
        let subscriber = &inner.subscriptions.remote().client;
        (subscriber.on_message(), subscriber.on_reconnect())
      }
      None => return,
    };
    let mut watching_reconnects = true;
    loop {
      let (channel, value) = tokio::select! {
        _ = stop.cancelled() => break,
        reconnected = reconnects.recv(), if watching_reconnects => {
          match reconnected {
            // A lagged receiver still means at least one reconnect happened
            Ok(_) | Err(RecvError::Lagged(_)) => {
              let subscriptions = match inner.upgrade() {
                Some(inner) => inner.subscriptions.clone(),
                None => break,
              };
              tracing::info!("Redis subscriber reconnected; restoring subscriptions");
              tokio::task::spawn(async move { subscriptions.resubscribe_all().await });
            }
            Err(RecvError::Closed) => watching_reconnects = false,
          }
          continue;
        }
        received = messages.recv() => match received {
          Ok(message) => message,
          Err(RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "Redis bus dispatch lagged; messages were dropped");
            continue;
          }
          Err(RecvError::Closed) => break,
        },
      };
      let body = match value {
        RedisValue::Bytes(bytes) => bytes.to_vec(),
        RedisValue::String(text) => text.as_bytes().to_vec(),
        other => {
          tracing::debug!(%channel, kind = ?other.kind(), "Ignoring non-binary redis message");
          continue;
        }
      };
      let message = match decode_envelope(channel, &body) {
        Ok(message) => message,
        Err(error) => {
          tracing::debug!(%error, "Discarding malformed bus envelope");
          continue;
        }
      };
      match inner.upgrade() {
        Some(inner) => {
          inner.subscriptions.deliver(&message);
        }
        None => break,
      }
    }
    tracing::debug!("Redis bus dispatch stopped");
  }
}

impl Bus for RedisBus {
  fn publish(&self, message: BusMessage) -> BoxFuture<'static, Result<(), BusError>> {
    let inner = self.inner.clone();
    async move {
      let envelope = encode_envelope(&message)?;
      let _: RedisValue = inner
        .publisher
        .publish(message.subject.as_str(), RedisValue::Bytes(envelope.into()))
        .await?;
      Ok(())
    }
    .boxed()
  }

  fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<Subscription, BusError>> {
    self.inner.subscriptions.subscribe(subject)
  }

  fn request(
    &self,
    subject: &str,
    payload: Vec<u8>,
    timeout: Duration,
  ) -> BoxFuture<'static, Result<BusMessage, BusError>> {
    request_via_inbox(self, subject, payload, timeout)
  }
}
