// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Local bridge wire protocol.
//!
//! Every frame is a JSON text message:
//!
//! ```text
//! { "type": "<snake_case type>", "payload": {...}, "timestamp": <unix ms>, "id": "<unique>" }
//! ```
//!
//! Handshake: client sends `handshake {version, geohash, pubkey, client}`,
//! bridge answers `handshake_ack {version, bluetoothEnabled, deviceCount}`.
//! Payload field names follow the bridge app (camelCase).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Client name announced in the handshake.
pub const CLIENT_NAME: &str = "soundchain-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMessageType {
    Handshake,
    HandshakeAck,
    Ping,
    Pong,
    ChatMessage,
    ChatReceived,
    MeshStatus,
    NearbyDevices,
    DeviceJoined,
    DeviceLeft,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    #[serde(rename = "type")]
    pub kind: BridgeMessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub id: String,
}

impl BridgeMessage {
    pub fn new(kind: BridgeMessageType, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            timestamp: chrono::Utc::now().timestamp_millis(),
            id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub version: String,
    pub geohash: String,
    pub pubkey: String,
    pub client: String,
}

/// Bridge answer to a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    #[serde(default)]
    pub version: String,
    /// Whether the local radio transport is on.
    #[serde(rename = "bluetoothEnabled", default)]
    pub radio_enabled: bool,
    #[serde(rename = "deviceCount", default)]
    pub peer_count: u32,
}

/// Outgoing chat line (`chat_message`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub content: String,
    pub geohash: String,
    pub pubkey: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Chat line relayed from the mesh (`chat_received`). Only `content` is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReceivedPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub geohash: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NearbyDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Signal strength in dBm.
    #[serde(default)]
    pub rssi: i32,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub is_bitchat: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub bluetooth_enabled: bool,
    #[serde(default)]
    pub device_count: u32,
    #[serde(default)]
    pub devices: Vec<NearbyDevice>,
}

/// `device_joined`, `device_left` and `nearby_devices` payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePayload {
    #[serde(default)]
    pub device: Option<NearbyDevice>,
    #[serde(default)]
    pub devices: Vec<NearbyDevice>,
}
