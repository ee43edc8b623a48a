// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is read from the environment once at startup by
//! [`AppConfig::from_env`]. Invalid values are reported as [`ConfigError`]
//! and stop the process; nothing is retried.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `identities.redb` | `./data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `RELAY_URLS` | Comma-separated `ws://`/`wss://` relay list | built-in public relays |
//! | `RELAY_PUBLISH_TIMEOUT_SECS` | Per-relay publish acknowledgement timeout | `10` |
//! | `RELAY_CONNECT_TIMEOUT_SECS` | Per-relay connect timeout | `5` |
//! | `SERVER_NOSTR_PRIVATE_KEY` | Hex or `nsec` secret of the notification identity, persisted on startup | persisted server identity |
//! | `NOTIFICATION_SIGNATURE` | Sign-off line appended to notifications | `SoundChain` |
//! | `NOTIFICATION_SITE_URL` | Base URL for notification links | `https://soundchain.io` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::keys::{keys_from_secret, Keys};
use crate::notification::{DEFAULT_SIGNATURE, DEFAULT_SITE_URL};
use crate::relay::DEFAULT_RELAYS;

/// Environment variable name for the data directory.
///
/// The identity database lives at `$DATA_DIR/identities.redb`.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const RELAY_URLS_ENV: &str = "RELAY_URLS";
pub const RELAY_PUBLISH_TIMEOUT_ENV: &str = "RELAY_PUBLISH_TIMEOUT_SECS";
pub const RELAY_CONNECT_TIMEOUT_ENV: &str = "RELAY_CONNECT_TIMEOUT_SECS";

/// Secret key of the notification identity.
///
/// When set it replaces the persisted server-scope identity at startup.
/// Unset means the persisted identity is used, which is fine for
/// development but ties the key to the data directory.
pub const SERVER_KEY_ENV: &str = "SERVER_NOSTR_PRIVATE_KEY";
pub const NOTIFICATION_SIGNATURE_ENV: &str = "NOTIFICATION_SIGNATURE";
pub const NOTIFICATION_SITE_URL_ENV: &str = "NOTIFICATION_SITE_URL";

/// `json` for structured output, anything else for human-readable logs.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_RELAY_PUBLISH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RELAY_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("RELAY_URLS lists no relays")]
    NoRelays,
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub relay_urls: Vec<String>,
    pub relay_publish_timeout: Duration,
    pub relay_connect_timeout: Duration,
    /// `None` when [`SERVER_KEY_ENV`] is unset.
    pub server_keys: Option<Keys>,
    pub notification_signature: String,
    pub notification_site_url: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("bind_addr", &self.bind_addr)
            .field("relay_urls", &self.relay_urls)
            .field("relay_publish_timeout", &self.relay_publish_timeout)
            .field("relay_connect_timeout", &self.relay_connect_timeout)
            .field("server_key", &self.server_keys.as_ref().map(|k| k.public_key().to_hex()))
            .field("notification_signature", &self.notification_signature)
            .field("notification_site_url", &self.notification_site_url)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or(&get, PORT_ENV, DEFAULT_PORT)?;
        let bind = format!("{host}:{port}");
        let bind_addr: SocketAddr = bind
            .parse()
            .map_err(|e| ConfigError::invalid(HOST_ENV, &host, e))?;

        let relay_urls = match get(RELAY_URLS_ENV) {
            Some(raw) => parse_relay_urls(&raw)?,
            None => DEFAULT_RELAYS.iter().map(|u| u.to_string()).collect(),
        };

        let server_keys = match get(SERVER_KEY_ENV) {
            Some(secret) => Some(
                keys_from_secret(&secret)
                    .map_err(|e| ConfigError::invalid(SERVER_KEY_ENV, "<redacted>", e))?,
            ),
            None => None,
        };

        Ok(Self {
            data_dir: get(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            bind_addr,
            relay_urls,
            relay_publish_timeout: Duration::from_secs(parse_or(
                &get,
                RELAY_PUBLISH_TIMEOUT_ENV,
                DEFAULT_RELAY_PUBLISH_TIMEOUT_SECS,
            )?),
            relay_connect_timeout: Duration::from_secs(parse_or(
                &get,
                RELAY_CONNECT_TIMEOUT_ENV,
                DEFAULT_RELAY_CONNECT_TIMEOUT_SECS,
            )?),
            server_keys,
            notification_signature: get(NOTIFICATION_SIGNATURE_ENV)
                .unwrap_or_else(|| DEFAULT_SIGNATURE.to_string()),
            notification_site_url: get(NOTIFICATION_SITE_URL_ENV)
                .unwrap_or_else(|| DEFAULT_SITE_URL.to_string()),
        })
    }

    pub fn identity_db_path(&self) -> PathBuf {
        self.data_dir.join("identities.redb")
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::invalid(var, &raw, e)),
        None => Ok(default),
    }
}

fn check_websocket_url(var: &'static str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::invalid(var, raw, e))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::invalid(var, raw, format!("unsupported scheme {other}"))),
    }
}

fn parse_relay_urls(raw: &str) -> Result<Vec<String>, ConfigError> {
    let urls: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();
    if urls.is_empty() {
        return Err(ConfigError::NoRelays);
    }
    for url in &urls {
        check_websocket_url(RELAY_URLS_ENV, url)?;
    }
    Ok(urls)
}
