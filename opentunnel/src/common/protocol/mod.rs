// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Binary wire formats
//!
//! All integers are big-endian; identifiers are ASCII with a `u16` length prefix.

pub mod buffer;
pub mod client_proto;
pub mod discover;
pub mod inner_socket;
pub mod well_known;

pub use buffer::{DecodeError, EncodeError};
pub use client_proto::{ClientHandshake, ClientMessage, MAX_FRAME_PAYLOAD};
pub use discover::DiscoverReply;
pub use inner_socket::InnerSocketMessage;
pub use well_known::WellKnownReply;
