// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Explicit session state machines
//!
//! Each session kind enumerates its states and the transitions it permits;
//! nothing leaves a terminal state.

use std::fmt::Debug;

pub trait SessionState: Copy + Eq + Debug + Send + 'static {
  fn name(self) -> &'static str;

  fn is_terminal(self) -> bool;

  /// Whether `self -> next` is a legal transition, ignoring terminality
  fn permits(self, next: Self) -> bool;
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal lifecycle transition from {from} to {to}")]
pub struct IllegalTransition {
  pub from: &'static str,
  pub to: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle<S: SessionState> {
  current: S,
}

impl<S: SessionState> Lifecycle<S> {
  pub fn new(initial: S) -> Self {
    Self { current: initial }
  }

  pub fn current(&self) -> S {
    self.current
  }

  pub fn is(&self, state: S) -> bool {
    self.current == state
  }

  pub fn is_terminal(&self) -> bool {
    self.current.is_terminal()
  }

  pub fn advance(&mut self, next: S) -> Result<S, IllegalTransition> {
    if self.current.is_terminal() || !self.current.permits(next) {
      return Err(IllegalTransition {
        from: self.current.name(),
        to: next.name(),
      });
    }
    tracing::trace!(from = self.current.name(), to = next.name(), "Lifecycle transition");
    let previous = self.current;
    self.current = next;
    Ok(previous)
  }

  /// Advances along a transition the caller's control flow guarantees is legal
  pub fn enter(&mut self, next: S) {
    if let Err(error) = self.advance(next) {
      tracing::error!(%error, "Session lifecycle violated");
      debug_assert!(false, "{}", error);
    }
  }
}

/// Frontend session: `created → discovering → connecting → established → destroyed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontendState {
  Created,
  Discovering,
  Connecting,
  Established,
  Destroyed,
}

impl SessionState for FrontendState {
  fn name(self) -> &'static str {
    match self {
      FrontendState::Created => "created",
      FrontendState::Discovering => "discovering",
      FrontendState::Connecting => "connecting",
      FrontendState::Established => "established",
      FrontendState::Destroyed => "destroyed",
    }
  }

  fn is_terminal(self) -> bool {
    self == FrontendState::Destroyed
  }

  fn permits(self, next: Self) -> bool {
    use FrontendState::*;
    matches!(
      (self, next),
      (Created, Discovering) | (Discovering, Connecting) | (Connecting, Established) | (_, Destroyed)
    )
  }
}

/// Backend session: `created → subscribing → started → stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
  Created,
  Subscribing,
  Started,
  Stopped,
}

impl SessionState for BackendState {
  fn name(self) -> &'static str {
    match self {
      BackendState::Created => "created",
      BackendState::Subscribing => "subscribing",
      BackendState::Started => "started",
      BackendState::Stopped => "stopped",
    }
  }

  fn is_terminal(self) -> bool {
    self == BackendState::Stopped
  }

  fn permits(self, next: Self) -> bool {
    use BackendState::*;
    matches!(
      (self, next),
      (Created, Subscribing) | (Subscribing, Started) | (_, Stopped)
    )
  }
}

/// Client connection: `dialing → connected → closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Dialing,
  Connected,
  Closed,
}

impl SessionState for ConnectionState {
  fn name(self) -> &'static str {
    match self {
      ConnectionState::Dialing => "dialing",
      ConnectionState::Connected => "connected",
      ConnectionState::Closed => "closed",
    }
  }

  fn is_terminal(self) -> bool {
    self == ConnectionState::Closed
  }

  fn permits(self, next: Self) -> bool {
    use ConnectionState::*;
    matches!((self, next), (Dialing, Connected) | (_, Closed))
  }
}

/// Client tunnel supervisor: `connecting → connected → waiting → connecting ...`, until `stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
  Connecting,
  Connected,
  Waiting,
  Stopped,
}

impl SessionState for TunnelState {
  fn name(self) -> &'static str {
    match self {
      TunnelState::Connecting => "connecting",
      TunnelState::Connected => "connected",
      TunnelState::Waiting => "waiting",
      TunnelState::Stopped => "stopped",
    }
  }

  fn is_terminal(self) -> bool {
    self == TunnelState::Stopped
  }

  fn permits(self, next: Self) -> bool {
    use TunnelState::*;
    matches!(
      (self, next),
      (Connecting, Connected) | (Connecting, Waiting) | (Connected, Waiting) | (Waiting, Connecting) | (_, Stopped)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::{BackendState, ConnectionState, FrontendState, Lifecycle, TunnelState};

  #[test]
  fn frontend_walks_forward_only() {
    let mut lifecycle = Lifecycle::new(FrontendState::Created);
    assert!(lifecycle.advance(FrontendState::Connecting).is_err());
    lifecycle.advance(FrontendState::Discovering).unwrap();
    lifecycle.advance(FrontendState::Connecting).unwrap();
    assert!(lifecycle.advance(FrontendState::Discovering).is_err());
    lifecycle.advance(FrontendState::Established).unwrap();
    assert_eq!(lifecycle.advance(FrontendState::Destroyed), Ok(FrontendState::Established));
    assert!(lifecycle.is_terminal());
  }

  #[test]
  fn terminal_states_are_final() {
    let mut lifecycle = Lifecycle::new(FrontendState::Discovering);
    lifecycle.advance(FrontendState::Destroyed).unwrap();
    let error = lifecycle.advance(FrontendState::Destroyed).unwrap_err();
    assert_eq!((error.from, error.to), ("destroyed", "destroyed"));

    let mut backend = Lifecycle::new(BackendState::Subscribing);
    backend.advance(BackendState::Stopped).unwrap();
    assert!(backend.advance(BackendState::Started).is_err());
  }

  #[test]
  fn backend_cannot_skip_subscribing() {
    let mut lifecycle = Lifecycle::new(BackendState::Created);
    assert!(lifecycle.advance(BackendState::Started).is_err());
    lifecycle.advance(BackendState::Subscribing).unwrap();
    lifecycle.advance(BackendState::Started).unwrap();
    assert!(lifecycle.is(BackendState::Started));
  }

  #[test]
  fn connections_and_tunnels() {
    let mut connection = Lifecycle::new(ConnectionState::Dialing);
    connection.advance(ConnectionState::Closed).unwrap();
    assert!(connection.advance(ConnectionState::Connected).is_err());

    let mut tunnel = Lifecycle::new(TunnelState::Connecting);
    for next in [TunnelState::Connected, TunnelState::Waiting, TunnelState::Connecting, TunnelState::Waiting] {
      tunnel.advance(next).unwrap();
    }
    assert!(tunnel.advance(TunnelState::Connected).is_err());
    tunnel.advance(TunnelState::Stopped).unwrap();
  }

  #[test]
  fn legal_entries_move_the_state() {
    let mut lifecycle = Lifecycle::new(BackendState::Created);
    lifecycle.enter(BackendState::Subscribing);
    lifecycle.enter(BackendState::Stopped);
    assert!(lifecycle.is(BackendState::Stopped));
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "Illegal lifecycle transition from stopped to started")]
  fn illegal_entries_are_caught() {
    let mut lifecycle = Lifecycle::new(BackendState::Subscribing);
    lifecycle.enter(BackendState::Stopped);
    lifecycle.enter(BackendState::Started);
  }
}
