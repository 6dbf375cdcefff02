// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types shared by every relay role
pub mod authentication;
pub mod bus;
pub mod lifecycle;
pub mod node_tracker;
pub mod presence;
pub mod protocol;
pub mod session_id;
pub mod sni;
