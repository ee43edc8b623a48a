// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encryption for private messages.
//!
//! - `nip44` - conversation keys and versioned authenticated encryption
//! - `gift_wrap` - rumor -> seal -> gift wrap layering and its inverse

pub mod gift_wrap;
pub mod nip44;

pub use gift_wrap::{
    build_rumor, gift_wrap, open_gift_wrap, randomized_timestamp, seal, unseal, unwrap, GiftWrap,
    OpenedMessage, Rumor, Seal, TIMESTAMP_WINDOW_SECS,
};
pub use nip44::{decrypt, derive_conversation_key, encrypt, ConversationKey};

use crate::event::EventError;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Nip44(String),

    #[error("decrypted payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("expected kind {expected}, found {found}")]
    WrongKind { expected: u16, found: u16 },

    #[error("signing key does not own the rumor")]
    SignerMismatch,

    #[error("gift wrap carries no recipient tag")]
    MissingRecipient,

    #[error("rumor id does not match its content")]
    InvalidRumorId,

    #[error("rumor author {rumor} does not match seal signer {seal}")]
    AuthorMismatch { seal: String, rumor: String },
}
