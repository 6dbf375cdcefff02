// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Globally-unique, locally-minted identifier for sessions, connections, and nodes
///
/// Always ASCII, so it can be used verbatim as a bus subject suffix and on the wire.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(String);

impl SessionId {
  pub fn new() -> Self {
    Self(uuid::Uuid::new_v4().hyphenated().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Default for SessionId {
  fn default() -> Self {
    Self::new()
  }
}

impl AsRef<str> for SessionId {
  fn as_ref(&self) -> &str {
    self.as_str()
  }
}

impl std::borrow::Borrow<str> for SessionId {
  fn borrow(&self) -> &str {
    self.as_str()
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SessionId").field(&self.0).finish()
  }
}

impl From<SessionId> for String {
  fn from(id: SessionId) -> Self {
    id.0
  }
}
