// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{future::Future, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub min: Duration,
  pub max: Duration,
  /// Consecutive failures after which the last error is returned
  pub max_failures: u32,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      min: Duration::from_millis(500),
      max: Duration::from_millis(15000),
      max_failures: 50,
    }
  }
}

impl BackoffPolicy {
  /// Delay before the attempt following `failures` consecutive failures
  pub fn delay_after(&self, failures: u32) -> Duration {
    let multiplier = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
    self.min.saturating_mul(multiplier).min(self.max)
  }
}

/// Runs `operation` until it succeeds or the policy's failure budget is spent
pub async fn retry_with_backoff<T, E, F, Fut>(
  policy: BackoffPolicy,
  operation_name: &str,
  mut operation: F,
) -> Result<T, E>
where
  E: std::fmt::Display,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let mut failures = 0u32;
  loop {
    match operation().await {
      Ok(result) => return Ok(result),
      Err(error) => {
        failures += 1;
        if failures >= policy.max_failures.max(1) {
          tracing::warn!(operation = operation_name, failures, %error, "Giving up after repeated failures");
          return Err(error);
        }
        let delay = policy.delay_after(failures);
        tracing::debug!(operation = operation_name, failures, %error, ?delay, "Retrying after failure");
        tokio::time::sleep(delay).await;
      }
    }
  }
}
