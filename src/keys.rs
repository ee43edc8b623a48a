// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! secp256k1 key material for relay identities.
//!
//! Public keys are BIP-340 x-only keys, rendered as 64 lowercase hex
//! characters on the wire. Users may also paste the human-readable `npub1…`
//! bech32 form (NIP-19), which is decoded before validation.

use nostr::nips::nip19::ToBech32;

pub use nostr::{Keys, PublicKey, SecretKey};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// Accept either hex or `npub` input.
pub fn parse_public_key(value: &str) -> Result<PublicKey, KeyError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(KeyError::InvalidPublicKey("empty".to_string()));
    }
    PublicKey::parse(trimmed).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Key pair from a hex (or `nsec`) secret.
pub fn keys_from_secret(secret: &str) -> Result<Keys, KeyError> {
    Keys::parse(secret.trim()).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))
}

/// Key pair from 32 raw secret bytes.
pub fn keys_from_secret_bytes(secret: &[u8]) -> Result<Keys, KeyError> {
    let secret = SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
    Ok(Keys::new(secret))
}

/// `npub1…` rendering of a public key.
pub trait ToNpub {
    fn to_npub(&self) -> String;
}

impl ToNpub for PublicKey {
    fn to_npub(&self) -> String {
        self.to_bech32().unwrap_or_else(|_| self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_npub_forms_resolve_to_same_key() {
        let keys = Keys::generate();
        let hex_form = keys.public_key().to_hex();
        let npub_form = keys.public_key().to_npub();

        assert_eq!(hex_form.len(), 64);
        assert!(npub_form.starts_with("npub1"));
        assert_eq!(parse_public_key(&hex_form).unwrap(), keys.public_key());
        assert_eq!(parse_public_key(&npub_form).unwrap(), keys.public_key());
        assert_eq!(parse_public_key(&format!("  {npub_form}\n")).unwrap(), keys.public_key());
    }

    #[test]
    fn secret_round_trips_through_hex_and_bytes() {
        let keys = Keys::generate();
        let secret = keys.secret_key().to_secret_bytes();

        let from_hex = keys_from_secret(&hex::encode(secret)).unwrap();
        let from_bytes = keys_from_secret_bytes(&secret).unwrap();
        assert_eq!(from_hex.public_key(), keys.public_key());
        assert_eq!(from_bytes.public_key(), keys.public_key());
    }

    #[test]
    fn rejects_malformed_keys() {
        for bad in ["", "  ", "abc", "npub1notreallybech32", &"zz".repeat(32)] {
            assert!(matches!(parse_public_key(bad), Err(KeyError::InvalidPublicKey(_))), "{bad:?}");
        }
        assert!(matches!(keys_from_secret("not-hex"), Err(KeyError::InvalidSecretKey(_))));
        assert!(matches!(keys_from_secret_bytes(&[1u8; 31]), Err(KeyError::InvalidSecretKey(_))));
    }
}
