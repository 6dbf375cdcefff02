// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![deny(dead_code, unused_imports)]

/// Something to do exactly once when its holder goes away
///
/// Sessions use it to notify their owner of destruction even if the
/// task driving them unwinds.
pub trait DropkickSync {
  fn dropkick(self);
}

/// A wrapper-type which [DropkickSync::dropkick]s its contents when dropped or kicked
#[derive(Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Dropkick<T: DropkickSync> {
  inner: Option<T>,
}

impl<T> Dropkick<T>
where
  T: DropkickSync,
{
  /// Create a new [Dropkick] instance, which will kick
  /// the provided target when dropped
  pub fn new(target: T) -> Self {
    Self {
      inner: Some(target),
    }
  }

  /// Kicks immediately rather than waiting for the wrapper to fall out of scope
  pub fn kick(mut self) {
    if let Some(inner) = self.inner.take() {
      DropkickSync::dropkick(inner);
    }
  }
}

impl<T> Drop for Dropkick<T>
where
  T: DropkickSync,
{
  fn drop(&mut self) {
    if let Some(inner) = self.inner.take() {
      DropkickSync::dropkick(inner);
    }
  }
}

/// Changes the semantics of a [::tokio_util::sync::CancellationToken] to cancel on drop
impl DropkickSync for ::tokio_util::sync::CancellationToken {
  fn dropkick(self) {
    if !self.is_cancelled() {
      self.cancel()
    }
  }
}

/// Calls a callback when dropkicked.
impl<F, R> DropkickSync for F
where
  F: FnOnce() -> R,
{
  fn dropkick(self) {
    (self)();
  }
}

#[cfg(test)]
mod tests {
  use super::{Dropkick, DropkickSync};

  #[repr(transparent)]
  struct DropkickFlag(pub bool);

  impl DropkickSync for &mut DropkickFlag {
    fn dropkick(self) {
      self.0 = true;
    }
  }

  #[test]
  fn dropkick_notifies() {
    let mut m = DropkickFlag(false);
    drop(Dropkick::new(&mut m));
    assert!(
      m.0,
      "Dropkick must call dropkick when allowed to drop naturally"
    );
  }

  #[test]
  fn dropkick_kicks_once() {
    let mut count = 0;
    Dropkick::new(|| count += 1).kick();
    assert_eq!(count, 1, "An explicit kick must not be repeated on drop");
  }

  #[test]
  fn dropkick_cancels_tokens() {
    let token = tokio_util::sync::CancellationToken::new();
    drop(Dropkick::new(token.clone()));
    assert!(token.is_cancelled());
  }
}
