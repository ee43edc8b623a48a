// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Versioned authenticated encryption between two key pairs (NIP-44 v2).
//!
//! ```text
//! conversation_key = HKDF-Extract(salt = "nip44-v2", ikm = ECDH(a, B).x)
//! payload = base64(0x02 || nonce || ChaCha20(pad(plaintext)) || HMAC(nonce || ciphertext))
//! ```
//!
//! ECDH is symmetric, so both parties derive the same conversation key no
//! matter who initiates. The cipher itself comes from `nostr::nips::nip44`.

use nostr::nips::nip44::{self, v2, Version};

use super::CryptoError;
use crate::keys::{Keys, PublicKey};

/// Symmetric key shared by a pair of identities.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

fn nip44_error(err: impl std::fmt::Display) -> CryptoError {
    CryptoError::Nip44(err.to_string())
}

/// Derive the conversation key between our secret and a peer public key.
pub fn derive_conversation_key(keys: &Keys, peer: &PublicKey) -> Result<ConversationKey, CryptoError> {
    let derived = v2::ConversationKey::derive(keys.secret_key(), peer).map_err(nip44_error)?;
    let bytes: [u8; 32] = derived.as_bytes()[..]
        .try_into()
        .map_err(|_| nip44_error("conversation key is not 32 bytes"))?;
    Ok(ConversationKey(bytes))
}

/// Encrypt `plaintext` from `keys` to `peer` with a fresh random nonce.
pub fn encrypt(keys: &Keys, peer: &PublicKey, plaintext: &str) -> Result<String, CryptoError> {
    nip44::encrypt(keys.secret_key(), peer, plaintext, Version::V2).map_err(nip44_error)
}

/// Decrypt a payload `peer` encrypted to `keys`. Fails when it was meant for someone else.
pub fn decrypt(keys: &Keys, peer: &PublicKey, payload: &str) -> Result<String, CryptoError> {
    nip44::decrypt(keys.secret_key(), peer, payload).map_err(nip44_error)
}
