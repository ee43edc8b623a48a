// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Geohash Channel Router
//!
//! Location chat over kind-20000 ephemeral events tagged with a geohash.
//! Messages are plaintext; only private messages are end-to-end encrypted.
//!
//! ## Tagging
//!
//! ```text
//! ["g", channel], ["g", parent], ...   channel first, then its ancestors down to Region
//! ["t", "soundchain"], ["t", "concert"], ["client", "soundchain.io"], extra tags...
//! ```
//!
//! Relays match `#g` exactly, so ancestor tags are what let a subscriber on a
//! parent channel see messages from the cells inside it. The first `g` tag is
//! always the channel the message was sent to.

use std::sync::Arc;

use serde::Serialize;

use crate::event::{
    first_tag_value, is_kind, location_chat_kind, sign_event, tag, tags_to_vec, unix_now, unix_secs,
    Event, EventError, Tag,
};
use crate::filter::Filter;
use crate::geohash::{self, GeohashError, Precision};
use crate::identity::Identity;
use crate::relay::{RelayError, RelayPool, Subscription};

/// How far back a new channel subscription looks.
pub const CHANNEL_HISTORY_SECS: i64 = 3600;

/// Shortest ancestor added as an extra `g` tag.
const MIN_ANCESTOR_TAG_LEN: usize = 3;

/// Opens the companion mesh-chat app on a channel.
pub fn deep_link(channel: &str) -> String {
    format!("bitchat://channel/{channel}")
}

/// Install page for the companion mesh-chat app.
pub const COMPANION_INSTALL_URL: &str = "https://apps.apple.com/us/app/bitchat-mesh/id6748219622";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("failed to sign channel message: {0}")]
    Event(#[from] EventError),

    #[error(transparent)]
    Geohash(#[from] GeohashError),

    #[error("message is empty")]
    EmptyMessage,
}

/// A location chat message as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelMessage {
    pub id: String,
    pub content: String,
    pub pubkey: String,
    pub timestamp: i64,
    /// Channel the message was posted to.
    pub geohash: String,
    pub tags: Vec<Vec<String>>,
}

impl ChannelMessage {
    fn from_event(event: Event, fallback_channel: &str) -> Self {
        let geohash = first_tag_value(event.tags.iter(), "g")
            .unwrap_or(fallback_channel)
            .to_string();
        Self {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            timestamp: unix_secs(event.created_at),
            geohash,
            tags: tags_to_vec(event.tags.iter()),
            content: event.content,
        }
    }
}

/// Oldest first, ties broken by id so the order is stable.
pub fn sort_for_display(messages: &mut [ChannelMessage]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// Geohash of a coordinate at a named precision.
pub fn location_to_channel(lat: f64, lon: f64, precision: Precision) -> Result<String, GeohashError> {
    geohash::encode(lat, lon, precision.geohash_len())
}

/// Every prefix of `channel`, shortest first.
pub fn channel_hierarchy(channel: &str) -> Vec<String> {
    geohash::hierarchy(channel)
}

#[derive(Clone)]
pub struct ChannelRouter {
    pool: Arc<RelayPool>,
}

impl ChannelRouter {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Stream messages for `channel`, and for its ancestors when `include_parents` is set.
    ///
    /// `include_parents` only widens the subscription upward to coarser
    /// cells. It never narrows it: senders tag every ancestor, so a
    /// subscriber on `9q8y` receives messages posted to `9q8yy` either way.
    pub fn subscribe_to_channel(&self, channel: &str, include_parents: bool) -> ChannelSubscription {
        let channels = if include_parents {
            channel_hierarchy(channel)
        } else {
            vec![channel.to_string()]
        };
        tracing::info!(channel = %channel, channels = ?channels, relays = self.pool.len(), "Subscribing to channel");

        let filter = Filter::new()
            .kinds([location_chat_kind()])
            .geohashes(channels)
            .since(unix_now() - CHANNEL_HISTORY_SECS);
        ChannelSubscription {
            channel: channel.to_string(),
            inner: self.pool.subscribe(filter),
        }
    }

    /// Sign and publish a plaintext message to `channel`.
    pub async fn send_to_channel(
        &self,
        identity: &Identity,
        channel: &str,
        text: &str,
        extra_tags: Vec<Tag>,
    ) -> Result<Event, ChannelError> {
        if text.trim().is_empty() {
            return Err(ChannelError::EmptyMessage);
        }
        geohash::bounds(channel)?;

        let mut tags = vec![tag("g", channel)];
        for ancestor in channel_hierarchy(channel).iter().rev().skip(1) {
            if ancestor.len() >= MIN_ANCESTOR_TAG_LEN {
                tags.push(tag("g", ancestor));
            }
        }
        tags.push(tag("t", "soundchain"));
        tags.push(tag("t", "concert"));
        tags.push(tag("client", "soundchain.io"));
        tags.extend(extra_tags);

        let event = sign_event(identity.keys(), location_chat_kind(), tags, text, unix_now())?;
        let report = self.pool.publish(&event).await?;
        tracing::info!(
            channel = %channel,
            event_id = %event.id.to_hex(),
            accepted = report.accepted_count(),
            attempted = self.pool.len(),
            "Sent channel message"
        );
        Ok(event)
    }
}

/// Location chat messages for one channel.
pub struct ChannelSubscription {
    channel: String,
    inner: Subscription,
}

impl ChannelSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            let event = self.inner.recv().await?;
            if !is_kind(event.kind, location_chat_kind()) {
                continue;
            }
            return Some(ChannelMessage::from_event(event, &self.channel));
        }
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
