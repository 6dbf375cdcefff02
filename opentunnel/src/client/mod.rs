// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Client role: carries tunneled connections between the relay and a local service

pub mod certificates;
pub mod connection;
pub mod managed;
pub mod registrar;
pub mod session;
pub mod state;
pub mod tunnel;

pub use connection::{ClientConnection, ClientConnectionHandle, CloseReason};
pub use managed::{ManagedEvent, ManagedTunnel, ManagedTunnelConfig, ManagedTunnelHandle};
pub use session::{
  ClientSession, ClientSessionConfig, ClientSessionHandle, HttpWellKnownResolver, SessionEnd, WellKnownResolver,
};
pub use tunnel::{ClientTunnel, ClientTunnelConfig, ClientTunnelHandle, TunnelEvent};
