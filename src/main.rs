// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use nostr_mesh::api::router;
use nostr_mesh::config::{AppConfig, DEFAULT_LOG_FILTER, LOG_FORMAT_ENV};
use nostr_mesh::identity::{IdentityManager, IdentityScope, IdentityStore};
use nostr_mesh::keys::ToNpub;
use nostr_mesh::notification::NotificationDispatcher;
use nostr_mesh::relay::RelayPool;
use nostr_mesh::state::AppState;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_identities(config: &AppConfig) -> IdentityManager {
    let path = config.identity_db_path();
    match IdentityStore::open(&path) {
        Ok(store) => IdentityManager::new(Arc::new(store)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Identity storage unavailable, identities will not persist");
            IdentityManager::without_storage()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::debug!(config = ?config, "Loaded configuration");

    let identities = open_identities(&config);
    let pool = Arc::new(
        RelayPool::from_urls(&config.relay_urls, config.relay_connect_timeout)
            .with_publish_timeout(config.relay_publish_timeout),
    );

    let server_keys = match config.server_keys.clone() {
        Some(keys) => match identities.adopt(&IdentityScope::Server, keys.clone()) {
            Ok(identity) => identity.keys().clone(),
            Err(e) => {
                tracing::warn!(error = %e, "Server key from environment not persisted");
                keys
            }
        },
        None => {
            tracing::warn!("SERVER_NOSTR_PRIVATE_KEY not set, using the stored server identity");
            identities.get_or_create(&IdentityScope::Server).keys().clone()
        }
    };
    let notifications = NotificationDispatcher::new(server_keys, pool.clone())
        .with_signature(config.notification_signature.clone())
        .with_site_url(config.notification_site_url.clone());
    tracing::info!(
        pubkey = %notifications.server_public_key().to_hex(),
        npub = %notifications.server_public_key().to_npub(),
        relays = pool.len(),
        "Notification identity ready"
    );

    let app = router(AppState::new(pool, identities, notifications));

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %config.bind_addr, "Nostr mesh server listening (docs at /docs)");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}
