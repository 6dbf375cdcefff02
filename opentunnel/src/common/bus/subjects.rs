// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Presence heartbeats carrying a node id
pub const NODES: &str = "nodes";

pub fn discover(host: &str) -> String {
  format!("discover-{}", host)
}

pub fn connect(socket_id: &str) -> String {
  format!("connect-{}", socket_id)
}

pub fn well_known(socket_id: &str) -> String {
  format!("wk-{}", socket_id)
}

/// Backend → frontend direction of a logical connection
pub fn connection_frontend(connection_id: &str) -> String {
  format!("connection-frontend-{}", connection_id)
}

/// Frontend → backend direction of a logical connection
pub fn connection_backend(connection_id: &str) -> String {
  format!("connection-backend-{}", connection_id)
}

pub fn inbox() -> String {
  format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
}
