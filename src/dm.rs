// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Private direct messages.
//!
//! A message is one kind-14 rumor tagged `[p, recipient]`, sealed once by the
//! sender and gift-wrapped twice: for the recipient, then for the sender so
//! their own client can show what they sent. Both wraps are published
//! independently; losing one does not affect the other.
//!
//! Readers see every gift wrap tagged with their key, most of which may not
//! decrypt for them. Those are dropped quietly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::crypto::{self, CryptoError};
use crate::event::{first_tag_value, tag_values, unix_now, Event, Kind, Tag};
use crate::filter::Filter;
use crate::keys::{Keys, PublicKey};
use crate::relay::{PublishReport, RelayError, RelayPool, Subscription};

/// How far back a private message subscription looks.
pub const DM_HISTORY_SECS: i64 = 7 * 24 * 60 * 60;

/// Replaceable event listing a user's preferred inbox relays.
pub const DM_RELAY_LIST_KIND: u16 = 10050;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DmError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("message is empty")]
    EmptyMessage,
}

/// A private message after unwrapping and unsealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedMessage {
    /// Rumor id; identical in the sender's and the recipient's copy.
    pub id: String,
    pub content: String,
    pub sender: String,
    /// First `p` tag of the rumor, empty when absent.
    pub recipient: String,
    pub timestamp: i64,
    pub kind: Kind,
}

/// Outcome of sending one private message.
#[derive(Debug, Clone)]
pub struct DmReceipt {
    pub rumor_id: String,
    pub recipient_wrap: Result<PublishReport, String>,
    pub sender_wrap: Result<PublishReport, String>,
}

impl DmReceipt {
    pub fn delivered_to_recipient(&self) -> bool {
        self.recipient_wrap.is_ok()
    }
}

/// Unwrap, unseal and flatten a gift wrap addressed to `reader`.
pub fn open_private_dm(wrap: &Event, reader: &Keys) -> Result<DecryptedMessage, CryptoError> {
    let opened = crypto::open_gift_wrap(wrap, reader)?;
    let rumor = opened.rumor;
    let recipient = first_tag_value(rumor.tags(), "p").unwrap_or_default().to_string();
    Ok(DecryptedMessage {
        id: rumor.id().to_hex(),
        content: rumor.content().to_string(),
        sender: rumor.author().to_hex(),
        recipient,
        timestamp: rumor.created_at(),
        kind: rumor.kind(),
    })
}

#[derive(Clone)]
pub struct DirectMessenger {
    pool: Arc<RelayPool>,
}

impl DirectMessenger {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self { pool }
    }

    /// Seal `text` for `recipient` and publish the two gift wraps.
    ///
    /// Fails only when neither wrap reached a relay.
    pub async fn send_private_dm(
        &self,
        sender: &Keys,
        recipient: &PublicKey,
        text: &str,
    ) -> Result<DmReceipt, DmError> {
        if text.is_empty() {
            return Err(DmError::EmptyMessage);
        }
        let rumor = crypto::build_rumor(
            sender,
            Kind::PrivateDirectMessage,
            vec![Tag::public_key(*recipient)],
            text,
        )?;
        let seal = crypto::seal(&rumor, sender, recipient)?;
        let for_recipient = crypto::gift_wrap(&seal, recipient)?;
        let for_sender = crypto::gift_wrap(&seal, &sender.public_key())?;

        let recipient_wrap = self
            .pool
            .publish(for_recipient.as_event())
            .await
            .map_err(|e| e.to_string());
        let sender_wrap = self
            .pool
            .publish(for_sender.as_event())
            .await
            .map_err(|e| e.to_string());

        if recipient_wrap.is_err() && sender_wrap.is_err() {
            return Err(RelayError::NoRelayAccepted {
                attempted: self.pool.len(),
            }
            .into());
        }
        Ok(DmReceipt {
            rumor_id: rumor.id().to_hex(),
            recipient_wrap,
            sender_wrap,
        })
    }

    fn inbox_filter(reader: PublicKey) -> Filter {
        Filter::new().kinds([Kind::GiftWrap]).pubkeys([reader])
    }

    /// Stream private messages addressed to `reader` from the last seven days.
    pub fn subscribe_private_dms(&self, reader: Keys) -> DmSubscription {
        let filter = Self::inbox_filter(reader.public_key()).since(unix_now() - DM_HISTORY_SECS);
        DmSubscription {
            inner: self.pool.subscribe(filter),
            reader,
        }
    }

    /// The latest `limit` messages exchanged with `peer`, oldest first.
    pub async fn fetch_dm_history(&self, reader: &Keys, peer: &PublicKey, limit: usize) -> Vec<DecryptedMessage> {
        let filter = Self::inbox_filter(reader.public_key()).limit(limit.saturating_mul(2));
        let wraps = self.pool.query(filter, QUERY_TIMEOUT).await;
        let peer = peer.to_hex();

        let mut messages: Vec<DecryptedMessage> = wraps
            .iter()
            .filter_map(|wrap| open_private_dm(wrap, reader).ok())
            .filter(|m| m.sender == peer || m.recipient == peer)
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        let skip = messages.len().saturating_sub(limit);
        messages.split_off(skip)
    }

    /// Inbox relays a user advertises, or the pool's relays when none are published.
    pub async fn fetch_dm_relays(&self, user: &PublicKey) -> Vec<String> {
        let filter = Filter::new()
            .kinds([Kind::from(DM_RELAY_LIST_KIND)])
            .authors([*user])
            .limit(1);
        let mut lists = self.pool.query(filter, QUERY_TIMEOUT).await;
        lists.sort_by_key(|e| std::cmp::Reverse(e.created_at));

        let advertised: Vec<String> = lists
            .first()
            .map(|list| tag_values(list.tags.iter(), "relay").map(str::to_string).collect())
            .unwrap_or_default();
        if advertised.is_empty() {
            self.pool.urls()
        } else {
            advertised
        }
    }
}

/// Decrypted private messages for one reader.
pub struct DmSubscription {
    inner: Subscription,
    reader: Keys,
}

impl DmSubscription {
    pub async fn recv(&mut self) -> Option<DecryptedMessage> {
        loop {
            let wrap = self.inner.recv().await?;
            match open_private_dm(&wrap, &self.reader) {
                Ok(message) => return Some(message),
                Err(e) => {
                    tracing::debug!(event_id = %wrap.id.to_hex(), error = %e, "Skipping gift wrap");
                }
            }
        }
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{sign_event, tag};
    use crate::relay::{MemoryRelay, RelayConnection};

    fn messenger_with(relays: &[Arc<MemoryRelay>]) -> DirectMessenger {
        let pool = RelayPool::new(relays.iter().map(|r| r.clone() as Arc<dyn RelayConnection>).collect());
        DirectMessenger::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn recipient_receives_message_exactly_once() {
        let relays = vec![Arc::new(MemoryRelay::new("memory://a")), Arc::new(MemoryRelay::new("memory://b"))];
        let messenger = messenger_with(&relays);
        let alice = Keys::generate();
        let bob = Keys::generate();

        let mut inbox = messenger.subscribe_private_dms(bob.clone());
        while relays.iter().any(|r| r.subscription_count() == 0) {
            tokio::task::yield_now().await;
        }

        let receipt = messenger
            .send_private_dm(&alice, &bob.public_key(), "hello")
            .await
            .unwrap();
        assert!(receipt.delivered_to_recipient());
        assert!(receipt.sender_wrap.is_ok());

        let message = inbox.recv().await.unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.sender, alice.public_key().to_hex());
        assert_eq!(message.recipient, bob.public_key().to_hex());
        assert_eq!(message.kind.as_u16(), 14);
        assert_eq!(message.id, receipt.rumor_id);

        let again = tokio::time::timeout(Duration::from_millis(100), inbox.recv()).await;
        assert!(again.is_err(), "message delivered twice");
    }

    #[tokio::test]
    async fn wraps_hide_the_sender_and_keep_a_copy_for_them() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let messenger = messenger_with(std::slice::from_ref(&relay));
        let alice = Keys::generate();
        let bob = Keys::generate();

        messenger.send_private_dm(&alice, &bob.public_key(), "hi").await.unwrap();
        let published = relay.published();
        assert_eq!(published.len(), 2);
        for wrap in &published {
            assert_eq!(wrap.kind.as_u16(), 1059);
            assert_ne!(wrap.pubkey, alice.public_key());
        }
        let target = |wrap: &Event| first_tag_value(wrap.tags.iter(), "p").map(str::to_string);
        assert_eq!(target(&published[0]), Some(bob.public_key().to_hex()));
        assert_eq!(target(&published[1]), Some(alice.public_key().to_hex()));

        let own_copy = open_private_dm(&published[1], &alice).unwrap();
        assert_eq!(own_copy.content, "hi");
        assert_eq!(own_copy.recipient, bob.public_key().to_hex());
        assert!(open_private_dm(&published[0], &alice).is_err());
    }

    #[tokio::test]
    async fn send_fails_only_when_nothing_was_published() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        relay.set_online(false);
        let messenger = messenger_with(std::slice::from_ref(&relay));

        let result = messenger
            .send_private_dm(&Keys::generate(), &Keys::generate().public_key(), "x")
            .await;
        assert!(matches!(result, Err(DmError::Relay(RelayError::NoRelayAccepted { .. }))));
    }

    #[tokio::test]
    async fn history_keeps_one_conversation_in_order() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let messenger = messenger_with(std::slice::from_ref(&relay));
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();

        messenger.send_private_dm(&alice, &bob.public_key(), "one").await.unwrap();
        messenger.send_private_dm(&carol, &bob.public_key(), "unrelated").await.unwrap();
        messenger.send_private_dm(&bob, &alice.public_key(), "two").await.unwrap();

        let history = messenger.fetch_dm_history(&bob, &alice.public_key(), 10).await;
        let mut contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        contents.sort();
        assert_eq!(contents, vec!["one", "two"]);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let limited = messenger.fetch_dm_history(&bob, &alice.public_key(), 1).await;
        assert!(limited.len() <= 1);
    }

    #[tokio::test]
    async fn dm_relays_fall_back_to_pool() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let messenger = messenger_with(std::slice::from_ref(&relay));
        let user = Keys::generate();

        assert_eq!(messenger.fetch_dm_relays(&user.public_key()).await, vec!["memory://a".to_string()]);

        let list = sign_event(
            &user,
            Kind::from(DM_RELAY_LIST_KIND),
            vec![tag("relay", "wss://inbox.example")],
            "",
            unix_now(),
        )
        .unwrap();
        relay.inject(list);
        assert_eq!(
            messenger.fetch_dm_relays(&user.public_key()).await,
            vec!["wss://inbox.example".to_string()]
        );
    }
}
