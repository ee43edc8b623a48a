// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Nostr Mesh - Decentralized Messaging Core
//!
//! Private messaging and location chat over public Nostr relays, with a
//! local mesh bridge preferred when one is running.
//!
//! ## Modules
//!
//! - `keys`, `event`, `filter` - keys, signed events and subscription filters
//! - `identity` - per-scope identities persisted in redb
//! - `crypto` - NIP-44 encryption and the rumor / seal / gift wrap pipeline
//! - `relay` - relay connections and the broadcasting pool
//! - `geohash`, `channel` - location channels
//! - `dm` - private direct messages
//! - `bridge` - mesh bridge client with relay fallback
//! - `notification` - server-signed private notifications
//! - `api` - HTTP API handlers (Axum)

pub mod api;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod dm;
pub mod error;
pub mod event;
pub mod filter;
pub mod geohash;
pub mod identity;
pub mod keys;
pub mod notification;
pub mod relay;
pub mod state;
