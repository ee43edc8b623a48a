// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Notification Dispatcher
//!
//! One-way private notifications sent as gift-wrapped direct messages from
//! the server identity. Any client that reads kind-14 messages shows them.
//!
//! ## Envelope
//!
//! ```text
//! rumor  kind 14, tags [["p", recipient]], author = server
//!  └ seal  kind 13, signed by server
//!     ├ gift wrap  kind 1059, ["p", recipient]   (published first)
//!     └ gift wrap  kind 1059, ["p", server]      (server's own copy)
//! ```
//!
//! Delivery is best effort: [`NotificationDispatcher::notify`] returns a
//! boolean and never fails the caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, CryptoError};
use crate::event::{Kind, Tag};
use crate::keys::{parse_public_key, KeyError, Keys, PublicKey};
use crate::relay::{PublishReport, RelayError, RelayPool};

pub const DEFAULT_SIGNATURE: &str = "SoundChain";
pub const DEFAULT_SITE_URL: &str = "https://soundchain.io";

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(#[source] KeyError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            link: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn new_follower(site: &str, follower_name: &str, follower_handle: &str) -> Self {
        Self::new(
            "New Follower",
            format!("{follower_name} (@{follower_handle}) started following you!"),
        )
        .with_link(format!("{site}/users/{follower_handle}"))
    }

    pub fn new_like(site: &str, liker_name: &str, post_id: &str) -> Self {
        Self::new("New Like", format!("{liker_name} liked your post!"))
            .with_link(format!("{site}/posts/{post_id}"))
    }

    pub fn new_comment(site: &str, commenter_name: &str, post_id: &str) -> Self {
        Self::new("New Comment", format!("{commenter_name} commented on your post!"))
            .with_link(format!("{site}/posts/{post_id}"))
    }

    pub fn new_direct_message(site: &str, sender_name: &str) -> Self {
        Self::new("New Message", format!("{sender_name} sent you a message!"))
            .with_link(format!("{site}/messages"))
    }

    pub fn new_tip(site: &str, tipper_name: &str, amount: &str) -> Self {
        Self::new("New Tip Received! 💰", format!("{tipper_name} tipped you {amount} OGUN!"))
            .with_link(format!("{site}/wallet"))
    }

    pub fn nft_sold(site: &str, buyer_name: &str, track_name: &str, price: &str) -> Self {
        Self::new(
            "NFT Sold! 🎉",
            format!("{buyer_name} bought your NFT \"{track_name}\" for {price}!"),
        )
        .with_link(format!("{site}/wallet"))
    }

    /// Streaming reward, worded for the track's creator or for a listener.
    pub fn reward_earned(site: &str, amount: &str, track_title: &str, is_creator: bool) -> Self {
        let (title, body) = if is_creator {
            (
                "Stream Royalty Earned! 🎵",
                format!("You earned {amount} OGUN from streams of \"{track_title}\""),
            )
        } else {
            (
                "Listening Reward! 🎧",
                format!("You earned {amount} OGUN for streaming \"{track_title}\""),
            )
        };
        Self::new(title, body).with_link(format!("{site}/wallet"))
    }
}

/// Text shown in the recipient's client.
pub fn format_message(notification: &Notification, signature: &str) -> String {
    let mut message = format!("🔔 {}\n\n{}", notification.title, notification.body);
    if let Some(link) = &notification.link {
        message.push_str(&format!("\n\n🔗 {link}"));
    }
    message.push_str(&format!("\n\n— {signature}"));
    message
}

#[derive(Debug, Clone)]
pub struct NotifyReport {
    pub rumor_id: String,
    pub recipient: PublishReport,
    /// `None` when the server's own copy reached no relay.
    pub server_copy: Option<PublishReport>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    keys: Keys,
    pool: Arc<RelayPool>,
    signature: String,
    site_url: String,
}

impl NotificationDispatcher {
    pub fn new(keys: Keys, pool: Arc<RelayPool>) -> Self {
        Self {
            keys,
            pool,
            signature: DEFAULT_SIGNATURE.to_string(),
            site_url: DEFAULT_SITE_URL.to_string(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.site_url = site_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Base URL for template links.
    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    /// Identity users can check notifications against.
    pub fn server_public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Send `notification` to `recipient` (hex or npub).
    ///
    /// True iff at least one relay accepted the recipient's wrap.
    pub async fn notify(&self, recipient: &str, notification: &Notification) -> bool {
        match self.try_notify(recipient, notification).await {
            Ok(_) => true,
            Err(NotificationError::InvalidRecipient(e)) => {
                let shown: String = recipient.chars().take(20).collect();
                tracing::warn!(recipient = %shown, error = %e, "Rejected notification recipient");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Notification not delivered");
                false
            }
        }
    }

    /// Like [`notify`](Self::notify) but with the failure reason.
    ///
    /// Malformed recipients are rejected before anything is published.
    pub async fn try_notify(
        &self,
        recipient: &str,
        notification: &Notification,
    ) -> Result<NotifyReport, NotificationError> {
        let recipient = parse_public_key(recipient).map_err(NotificationError::InvalidRecipient)?;

        let rumor = crypto::build_rumor(
            &self.keys,
            Kind::PrivateDirectMessage,
            vec![Tag::public_key(recipient)],
            format_message(notification, &self.signature),
        )?;
        let seal = crypto::seal(&rumor, &self.keys, &recipient)?;
        let for_recipient = crypto::gift_wrap(&seal, &recipient)?;
        let for_server = crypto::gift_wrap(&seal, &self.keys.public_key())?;

        let delivered = self.pool.publish(for_recipient.as_event()).await;
        let server_copy = match self.pool.publish(for_server.as_event()).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Server copy of notification not stored");
                None
            }
        };

        let report = delivered?;
        tracing::info!(
            rumor_id = %rumor.id().to_hex(),
            accepted = report.accepted_count(),
            attempted = self.pool.len(),
            "Notification published"
        );
        Ok(NotifyReport {
            rumor_id: rumor.id().to_hex(),
            recipient: report,
            server_copy,
        })
    }
}
