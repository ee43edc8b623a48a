// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity Manager.
//!
//! One key pair per privacy scope, created lazily and persisted in redb so
//! repeated lookups for the same scope return the same keys. Regional scopes
//! are bucketed by the first four geohash characters, which keeps a user's
//! identity in one city unlinkable from their identity in another.
//!
//! ## Table Layout
//!
//! - `identities`: storage key → 32-byte secret
//!
//! ## Degradation
//!
//! [`IdentityManager::try_get_or_create`] reports storage problems as
//! [`StorageUnavailable`]. [`IdentityManager::get_or_create`] turns that into
//! an in-memory ephemeral identity and logs a warning.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::keys::{keys_from_secret_bytes, Keys, PublicKey};

const IDENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("identities");

/// Number of geohash characters that select a regional identity.
pub const REGION_PREFIX_LEN: usize = 4;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity storage could not be read or written.
#[derive(Debug, thiserror::Error)]
#[error("identity storage unavailable: {reason}")]
pub struct StorageUnavailable {
    pub reason: String,
}

impl From<IdentityError> for StorageUnavailable {
    fn from(err: IdentityError) -> Self {
        Self {
            reason: err.to_string(),
        }
    }
}

// =============================================================================
// Scopes
// =============================================================================

/// Which identity to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityScope {
    /// Default identity when no location is involved.
    Global,
    /// Identity bound to a geohash region (first four characters).
    Region(String),
    /// The server's notification identity.
    Server,
}

impl IdentityScope {
    /// Regional scope for any geohash; shorter inputs are used as-is.
    pub fn for_geohash(geohash: &str) -> Self {
        let prefix: String = geohash
            .chars()
            .take(REGION_PREFIX_LEN)
            .collect::<String>()
            .to_lowercase();
        if prefix.is_empty() {
            IdentityScope::Global
        } else {
            IdentityScope::Region(prefix)
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            IdentityScope::Global => "identity_global".to_string(),
            IdentityScope::Region(prefix) => format!("identity_{prefix}"),
            IdentityScope::Server => "identity_server".to_string(),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone)]
pub struct Identity {
    scope: IdentityScope,
    keys: Keys,
    persisted: bool,
}

impl Identity {
    pub fn ephemeral(scope: IdentityScope) -> Self {
        Self {
            scope,
            keys: Keys::generate(),
            persisted: false,
        }
    }

    pub fn scope(&self) -> &IdentityScope {
        &self.scope
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// False for ephemeral fallbacks that vanish with the process.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

// =============================================================================
// Store
// =============================================================================

/// redb-backed secret storage.
pub struct IdentityStore {
    db: Database,
}

impl IdentityStore {
    pub fn open(path: &Path) -> Result<Self, IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITIES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Return the stored secret for `key`, or store and return the one built by `create`.
    ///
    /// Lookup and insert share one write transaction, so concurrent callers
    /// for the same scope converge on a single secret.
    fn load_or_insert(&self, key: &str, create: impl FnOnce() -> Keys) -> Result<Keys, IdentityError> {
        let write_txn = self.db.begin_write()?;
        let keys = {
            let mut table = write_txn.open_table(IDENTITIES)?;
            let existing = table.get(key)?.map(|stored| stored.value().to_vec());
            match existing.as_deref().map(keys_from_secret_bytes) {
                Some(Ok(keys)) => return Ok(keys),
                Some(Err(err)) => {
                    tracing::warn!(scope = %key, error = %err, "Stored identity is corrupt, regenerating");
                }
                None => {}
            }
            let keys = create();
            let secret = keys.secret_key().to_secret_bytes();
            table.insert(key, &secret[..])?;
            keys
        };
        write_txn.commit()?;
        Ok(keys)
    }

    /// Store `keys` under `key`, replacing any existing secret.
    fn put(&self, key: &str, keys: &Keys) -> Result<(), IdentityError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITIES)?;
            let secret = keys.secret_key().to_secret_bytes();
            table.insert(key, &secret[..])?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Whether a secret exists for `scope`.
    pub fn contains(&self, scope: &IdentityScope) -> Result<bool, IdentityError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(IDENTITIES)?;
        Ok(table.get(scope.storage_key().as_str())?.is_some())
    }

    /// Forget the identity for `scope`. The next lookup creates a new one.
    pub fn clear(&self, scope: &IdentityScope) -> Result<(), IdentityError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITIES)?;
            table.remove(scope.storage_key().as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Clone)]
pub struct IdentityManager {
    store: Option<Arc<IdentityStore>>,
}

impl IdentityManager {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A manager with no persistence: every lookup degrades to an ephemeral identity.
    pub fn without_storage() -> Self {
        Self { store: None }
    }

    pub fn has_storage(&self) -> bool {
        self.store.is_some()
    }

    /// Persisted identity for `scope`, created on first use.
    pub fn try_get_or_create(&self, scope: &IdentityScope) -> Result<Identity, StorageUnavailable> {
        let store = self.store.as_ref().ok_or_else(|| StorageUnavailable {
            reason: "no identity store configured".to_string(),
        })?;
        let keys = store.load_or_insert(&scope.storage_key(), Keys::generate)?;
        Ok(Identity {
            scope: scope.clone(),
            keys,
            persisted: true,
        })
    }

    /// Like [`Self::try_get_or_create`], falling back to an ephemeral identity.
    pub fn get_or_create(&self, scope: &IdentityScope) -> Identity {
        match self.try_get_or_create(scope) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(
                    scope = %scope.storage_key(),
                    error = %err,
                    "Using ephemeral identity"
                );
                Identity::ephemeral(scope.clone())
            }
        }
    }

    /// Persist `keys` as the identity for `scope`, replacing any stored one.
    pub fn adopt(&self, scope: &IdentityScope, keys: Keys) -> Result<Identity, StorageUnavailable> {
        let store = self.store.as_ref().ok_or_else(|| StorageUnavailable {
            reason: "no identity store configured".to_string(),
        })?;
        store.put(&scope.storage_key(), &keys)?;
        Ok(Identity {
            scope: scope.clone(),
            keys,
            persisted: true,
        })
    }
}
