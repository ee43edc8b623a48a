// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relay connectivity.
//!
//! - `message` - client/relay wire messages (JSON arrays)
//! - `websocket` - a live relay over WebSocket
//! - `memory` - an in-process relay for tests and local runs
//! - `pool` - the broadcaster that fans publishes and subscriptions out to every relay

pub mod memory;
pub mod message;
pub mod pool;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::filter::Filter;

pub use memory::MemoryRelay;
pub use pool::{PublishReport, RelayPool, Subscription};
pub use websocket::WebSocketRelay;

/// Public relays used when none are configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.snort.social",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.primal.net",
];

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("relay {url} did not answer in time")]
    Timeout { url: String },

    #[error("relay {url} rejected the event: {reason}")]
    Rejected { url: String, reason: String },

    #[error("connection to {url} closed")]
    Closed { url: String },

    #[error("malformed relay message: {0}")]
    Protocol(String),

    #[error("failed to publish to any relay ({attempted} attempted)")]
    NoRelayAccepted { attempted: usize },
}

/// Items delivered on a single relay subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Event(Event),
    /// The relay has sent everything it had stored; live events follow.
    EndOfStoredEvents,
}

/// One relay endpoint.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    fn url(&self) -> &str;

    /// Send `event` and wait for the relay's acceptance.
    async fn publish(&self, event: &Event) -> Result<(), RelayError>;

    /// Open a subscription. The stream ends when the relay closes it.
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: &Filter,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError>;

    async fn unsubscribe(&self, subscription_id: &str);
}

/// Poison-tolerant lock for short critical sections.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
