// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod backoff;
pub mod cancellation;
pub mod dropkick;
pub mod framed;
pub mod http;
pub mod slot;
pub mod validators;

/// Seconds since the unix epoch, saturating at zero for clocks set before 1970
pub fn unix_time_secs() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::SystemTime::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
