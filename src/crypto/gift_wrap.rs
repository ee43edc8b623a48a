// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Rumor, Seal, Gift Wrap
//!
//! Three fixed layers, always applied in this order:
//!
//! ```text
//! Rumor (kind 14, unsigned, has id)
//!   └─ Seal (kind 13, signed by the sender, content = encrypt(rumor, sender -> recipient))
//!        └─ GiftWrap (kind 1059, signed by a one-time key, tagged [p, target],
//!                     content = encrypt(seal, ephemeral -> target))
//! ```
//!
//! Seals and gift wraps carry a `created_at` drawn uniformly from the last
//! [`TIMESTAMP_WINDOW_SECS`] seconds so relays cannot correlate them with the
//! moment of sending. Layers are distinct types: a [`GiftWrap`] can only be
//! built from a [`Seal`], and a [`Seal`] only from a [`Rumor`].

use rand::Rng;

use super::nip44::{decrypt, encrypt};
use super::CryptoError;
use crate::event::{
    first_tag_value, is_kind, sign_event, timestamp, unix_now, unix_secs, verify_event, Event,
    EventBuilder, EventId, Kind, Tag, UnsignedEvent,
};
use crate::keys::{Keys, PublicKey};

/// Width of the timestamp randomization window (two days).
pub const TIMESTAMP_WINDOW_SECS: i64 = 172_800;

/// A timestamp sampled uniformly from `[now - TIMESTAMP_WINDOW_SECS, now]`.
pub fn randomized_timestamp(now: i64) -> i64 {
    randomized_timestamp_with(now, &mut rand::thread_rng())
}

pub fn randomized_timestamp_with<R: Rng + ?Sized>(now: i64, rng: &mut R) -> i64 {
    now - rng.gen_range(0..=TIMESTAMP_WINDOW_SECS)
}

// =============================================================================
// Rumor
// =============================================================================

/// An unsigned message with a content-hash id. Never published as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rumor {
    id: EventId,
    event: UnsignedEvent,
}

impl Rumor {
    fn from_unsigned(mut event: UnsignedEvent) -> Result<Self, CryptoError> {
        event.ensure_id();
        let id = event.id.ok_or(CryptoError::InvalidRumorId)?;
        Ok(Self { id, event })
    }

    /// Accept a decrypted rumor only when its id hashes its content.
    fn verified(event: UnsignedEvent) -> Result<Self, CryptoError> {
        let claimed = event.id.ok_or(CryptoError::InvalidRumorId)?;
        let mut recomputed = event.clone();
        recomputed.id = None;
        recomputed.ensure_id();
        if recomputed.id != Some(claimed) {
            return Err(CryptoError::InvalidRumorId);
        }
        Ok(Self { id: claimed, event })
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn author(&self) -> PublicKey {
        self.event.pubkey
    }

    pub fn kind(&self) -> Kind {
        self.event.kind
    }

    pub fn created_at(&self) -> i64 {
        unix_secs(self.event.created_at)
    }

    pub fn content(&self) -> &str {
        &self.event.content
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.event.tags.iter()
    }

    pub fn as_unsigned(&self) -> &UnsignedEvent {
        &self.event
    }
}

/// Build a rumor authored by `keys`, stamped with the current time.
pub fn build_rumor(
    keys: &Keys,
    kind: Kind,
    tags: Vec<Tag>,
    content: impl Into<String>,
) -> Result<Rumor, CryptoError> {
    build_rumor_at(keys, kind, tags, content, unix_now())
}

pub fn build_rumor_at(
    keys: &Keys,
    kind: Kind,
    tags: Vec<Tag>,
    content: impl Into<String>,
    created_at: i64,
) -> Result<Rumor, CryptoError> {
    let unsigned = EventBuilder::new(kind, content.into())
        .tags(tags)
        .custom_created_at(timestamp(created_at))
        .build(keys.public_key());
    Rumor::from_unsigned(unsigned)
}

// =============================================================================
// Layer types
// =============================================================================

/// A verified kind-13 event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal(Event);

/// A verified kind-1059 event carrying a recipient tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftWrap(Event);

impl Seal {
    pub fn as_event(&self) -> &Event {
        &self.0
    }

    pub fn into_event(self) -> Event {
        self.0
    }
}

impl GiftWrap {
    pub fn as_event(&self) -> &Event {
        &self.0
    }

    pub fn into_event(self) -> Event {
        self.0
    }

    /// The `p` tag this wrap is addressed to.
    pub fn target(&self) -> &str {
        first_tag_value(self.0.tags.iter(), "p").unwrap_or_default()
    }
}

fn expect_kind(event: &Event, expected: Kind) -> Result<(), CryptoError> {
    if !is_kind(event.kind, expected) {
        return Err(CryptoError::WrongKind {
            expected: expected.as_u16(),
            found: event.kind.as_u16(),
        });
    }
    Ok(())
}

impl TryFrom<Event> for Seal {
    type Error = CryptoError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        expect_kind(&event, Kind::Seal)?;
        verify_event(&event)?;
        Ok(Seal(event))
    }
}

impl TryFrom<Event> for GiftWrap {
    type Error = CryptoError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        expect_kind(&event, Kind::GiftWrap)?;
        if first_tag_value(event.tags.iter(), "p").is_none() {
            return Err(CryptoError::MissingRecipient);
        }
        verify_event(&event)?;
        Ok(GiftWrap(event))
    }
}

// =============================================================================
// Wrapping
// =============================================================================

/// Encrypt `rumor` for `recipient` and sign the seal with the sender's key.
pub fn seal(rumor: &Rumor, sender: &Keys, recipient: &PublicKey) -> Result<Seal, CryptoError> {
    if rumor.author() != sender.public_key() {
        return Err(CryptoError::SignerMismatch);
    }
    let content = encrypt(sender, recipient, &serde_json::to_string(rumor.as_unsigned())?)?;
    let event = sign_event(
        sender,
        Kind::Seal,
        Vec::new(),
        content,
        randomized_timestamp(unix_now()),
    )?;
    Ok(Seal(event))
}

/// Encrypt `seal` for `target` under a fresh one-time key.
pub fn gift_wrap(seal: &Seal, target: &PublicKey) -> Result<GiftWrap, CryptoError> {
    let ephemeral = Keys::generate();
    let content = encrypt(&ephemeral, target, &serde_json::to_string(seal.as_event())?)?;
    let event = sign_event(
        &ephemeral,
        Kind::GiftWrap,
        vec![Tag::public_key(*target)],
        content,
        randomized_timestamp(unix_now()),
    )?;
    Ok(GiftWrap(event))
}

// =============================================================================
// Unwrapping
// =============================================================================

/// Peel the outer layer. Fails with `Nip44` when the wrap is not for `reader`.
pub fn unwrap(wrap: &GiftWrap, reader: &Keys) -> Result<Seal, CryptoError> {
    let json = decrypt(reader, &wrap.as_event().pubkey, &wrap.as_event().content)?;
    let inner: Event = serde_json::from_str(&json)?;
    Seal::try_from(inner)
}

/// Decrypt the rumor and check it was authored by the seal's signer.
pub fn unseal(seal: &Seal, reader: &Keys) -> Result<Rumor, CryptoError> {
    let signer = seal.as_event().pubkey;
    let json = decrypt(reader, &signer, &seal.as_event().content)?;
    let rumor = Rumor::verified(serde_json::from_str::<UnsignedEvent>(&json)?)?;

    if rumor.author() != signer {
        tracing::warn!(
            target: "security",
            seal_signer = %signer.to_hex(),
            rumor_author = %rumor.author().to_hex(),
            seal_id = %seal.as_event().id.to_hex(),
            "Discarding sealed message with forged author"
        );
        return Err(CryptoError::AuthorMismatch {
            seal: signer.to_hex(),
            rumor: rumor.author().to_hex(),
        });
    }
    Ok(rumor)
}

/// A fully opened message: the rumor plus the verified signer of its seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    pub rumor: Rumor,
    pub seal_signer: PublicKey,
}

/// Validate, unwrap and unseal a raw relay event in one step.
pub fn open_gift_wrap(event: &Event, reader: &Keys) -> Result<OpenedMessage, CryptoError> {
    let wrap = GiftWrap::try_from(event.clone())?;
    let seal = unwrap(&wrap, reader)?;
    let rumor = unseal(&seal, reader)?;
    let seal_signer = seal.as_event().pubkey;
    Ok(OpenedMessage { rumor, seal_signer })
}
