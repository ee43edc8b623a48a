// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::identity::IdentityManager;
use crate::notification::NotificationDispatcher;
use crate::relay::RelayPool;

/// Shared handles for request handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<RelayPool>,
    pub identities: IdentityManager,
    pub notifications: NotificationDispatcher,
}

impl AppState {
    pub fn new(pool: Arc<RelayPool>, identities: IdentityManager, notifications: NotificationDispatcher) -> Self {
        Self {
            pool,
            identities,
            notifications,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::keys::Keys;
    use crate::relay::{MemoryRelay, RelayConnection};

    /// State backed by in-memory relays and no identity storage.
    pub fn state_with(relays: &[Arc<MemoryRelay>]) -> AppState {
        let pool = Arc::new(RelayPool::new(
            relays.iter().map(|r| r.clone() as Arc<dyn RelayConnection>).collect(),
        ));
        let notifications = NotificationDispatcher::new(Keys::generate(), pool.clone());
        AppState::new(pool, IdentityManager::without_storage(), notifications)
    }
}
