// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Client for a local mesh bridge, with relay fallback.
//!
//! A companion app on the same machine can relay chat over a short-range
//! radio mesh and exposes it on a local WebSocket. When it is not running
//! the client carries the same channel over Nostr relays instead.

mod client;
pub mod protocol;

pub use client::{
    BridgeClient, BridgeConfig, BridgeError, BridgeEvent, ConnectionMode, DEFAULT_BRIDGE_URL,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_INTERVAL,
};
pub use protocol::{HandshakeAck, MeshStatus, NearbyDevice};
