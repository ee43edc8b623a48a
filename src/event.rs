// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Relay Envelopes
//!
//! Signed events as exchanged with public relays, plus the small helpers
//! the rest of the crate uses to build and read them.
//!
//! ## Wire Shape
//!
//! ```text
//! {id, pubkey, created_at, kind, tags: [[string, ...]], content, sig}
//! ```
//!
//! Hashing and BIP-340 signing are done by `nostr`; this module only fixes
//! the kinds and tag conventions of this application.

pub use nostr::{Event, EventBuilder, EventId, Kind, Tag, TagKind, Timestamp, UnsignedEvent};

use crate::keys::Keys;

/// Ephemeral geohash-tagged location chat message.
pub const LOCATION_CHAT_KIND: u16 = 20000;

pub fn location_chat_kind() -> Kind {
    Kind::from(LOCATION_CHAT_KIND)
}

/// Kind equality by number, independent of which named variant was parsed.
pub fn is_kind(kind: Kind, expected: Kind) -> bool {
    kind.as_u16() == expected.as_u16()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("failed to sign event: {0}")]
    Sign(String),

    #[error("invalid event: {0}")]
    Invalid(String),
}

/// A `[name, value]` tag.
pub fn tag(name: &str, value: &str) -> Tag {
    Tag::custom(TagKind::Custom(name.to_string().into()), [value.to_string()])
}

/// Second element of every tag called `name`.
pub fn tag_values<'a, I>(tags: I, name: &'a str) -> impl Iterator<Item = &'a str> + 'a
where
    I: IntoIterator<Item = &'a Tag>,
    I::IntoIter: 'a,
{
    tags.into_iter().filter_map(move |tag| match tag.as_slice() {
        [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
        _ => None,
    })
}

/// First value of the first `name` tag, e.g. `first_tag_value(event.tags.iter(), "g")`.
pub fn first_tag_value<'a, I>(tags: I, name: &'a str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a Tag>,
    I::IntoIter: 'a,
{
    tag_values(tags, name).next()
}

/// Plain string form of a tag list, for JSON responses and bridge frames.
pub fn tags_to_vec<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Vec<Vec<String>> {
    tags.into_iter().map(|tag| tag.as_slice().to_vec()).collect()
}

/// Build and sign in one step.
pub fn sign_event(
    keys: &Keys,
    kind: Kind,
    tags: Vec<Tag>,
    content: impl Into<String>,
    created_at: i64,
) -> Result<Event, EventError> {
    EventBuilder::new(kind, content.into())
        .tags(tags)
        .custom_created_at(timestamp(created_at))
        .sign_with_keys(keys)
        .map_err(|e| EventError::Sign(e.to_string()))
}

/// Recompute the id and check the signature.
pub fn verify_event(event: &Event) -> Result<(), EventError> {
    event.verify().map_err(|e| EventError::Invalid(e.to_string()))
}

/// Seconds since the epoch as a relay timestamp; negative values clamp to zero.
pub fn timestamp(secs: i64) -> Timestamp {
    Timestamp::from_secs(secs.max(0) as u64)
}

pub fn unix_secs(timestamp: Timestamp) -> i64 {
    timestamp.as_secs() as i64
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_chat_is_ephemeral() {
        assert!(location_chat_kind().is_ephemeral());
        assert!(!Kind::GiftWrap.is_ephemeral());
        assert!(is_kind(Kind::from(1059), Kind::GiftWrap));
        assert!(!is_kind(location_chat_kind(), Kind::GiftWrap));
    }

    #[test]
    fn signed_event_verifies_and_detects_tampering() {
        let keys = Keys::generate();
        let tags = vec![tag("g", "9q8yy"), tag("t", "concert")];
        let event = sign_event(&keys, location_chat_kind(), tags, "hello", 1_700_000_000).unwrap();

        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(unix_secs(event.created_at), 1_700_000_000);
        assert!(verify_event(&event).is_ok());

        let mut tampered = event.clone();
        tampered.content = "goodbye".to_string();
        assert!(matches!(verify_event(&tampered), Err(EventError::Invalid(_))));
    }

    #[test]
    fn tag_accessors_pick_matching_values() {
        let tags = vec![tag("t", "soundchain"), tag("g", "9q8y"), tag("g", "9q8yy")];
        assert_eq!(first_tag_value(tags.iter(), "g"), Some("9q8y"));
        assert_eq!(tag_values(tags.iter(), "g").collect::<Vec<_>>(), vec!["9q8y", "9q8yy"]);
        assert_eq!(first_tag_value(tags.iter(), "p"), None);
        assert_eq!(tags_to_vec(tags.iter())[0], vec!["t".to_string(), "soundchain".to_string()]);
    }

    #[test]
    fn event_wire_shape_matches_relay_protocol() {
        let keys = Keys::generate();
        let event = sign_event(&keys, Kind::GiftWrap, vec![tag("p", "ab")], "x", 5).unwrap();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], 1059);
        assert_eq!(value["created_at"], 5);
        assert_eq!(value["tags"], serde_json::json!([["p", "ab"]]));
        assert_eq!(value["pubkey"], keys.public_key().to_hex());

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
        assert!(verify_event(&parsed).is_ok());
    }

    #[test]
    fn negative_timestamps_clamp_to_epoch() {
        assert_eq!(unix_secs(timestamp(-5)), 0);
        assert_eq!(unix_secs(timestamp(42)), 42);
    }
}
