// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Subscription filters.
//!
//! Sent to relays as `{kinds, authors, "#g", "#p", since, until, limit}`;
//! absent fields match everything. Relays evaluate filters remotely and
//! `matches` is the same predicate evaluated locally: the in-memory relay
//! uses it to route, and the pool re-checks every relay delivery with it.

use nostr::{Alphabet, SingleLetterTag};

use crate::crypto::TIMESTAMP_WINDOW_SECS;
use crate::event::{is_kind, tag_values, timestamp, unix_secs, Event, Kind};
use crate::keys::PublicKey;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub authors: Option<Vec<PublicKey>>,
    pub kinds: Option<Vec<Kind>>,
    pub geohashes: Option<Vec<String>>,
    pub pubkeys: Option<Vec<PublicKey>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn geohashes(mut self, geohashes: impl IntoIterator<Item = String>) -> Self {
        self.geohashes = Some(geohashes.into_iter().collect());
        self
    }

    pub fn pubkeys(mut self, pubkeys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.pubkeys = Some(pubkeys.into_iter().collect());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn includes_kind(&self, kind: Kind) -> bool {
        self.kinds
            .as_ref()
            .is_none_or(|kinds| kinds.iter().any(|k| is_kind(*k, kind)))
    }

    /// The filter to reopen a dropped subscription with, given the newest
    /// `created_at` already delivered.
    ///
    /// Gift wraps are backdated by up to two days, so for them the window
    /// reaches back that far; duplicates are suppressed downstream.
    pub fn resume_from(&self, newest_seen: i64) -> Filter {
        let lookback = if self.includes_kind(Kind::GiftWrap) {
            TIMESTAMP_WINDOW_SECS
        } else {
            0
        };
        let since = newest_seen - lookback;
        let mut resumed = self.clone();
        resumed.since = Some(self.since.map_or(since, |original| original.max(since)));
        resumed
    }

    /// Whether `event` satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if !self.includes_kind(event.kind) {
            return false;
        }
        if let Some(geohashes) = &self.geohashes {
            if !tag_values(event.tags.iter(), "g").any(|g| geohashes.iter().any(|want| want == g)) {
                return false;
            }
        }
        if let Some(pubkeys) = &self.pubkeys {
            let wanted: Vec<String> = pubkeys.iter().map(PublicKey::to_hex).collect();
            if !tag_values(event.tags.iter(), "p").any(|p| wanted.iter().any(|want| want == p)) {
                return false;
            }
        }
        let created_at = unix_secs(event.created_at);
        if self.since.is_some_and(|since| created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| created_at > until) {
            return false;
        }
        true
    }

    /// Wire form for a `REQ` frame.
    pub fn to_nostr(&self) -> nostr::Filter {
        let mut filter = nostr::Filter::new();
        if let Some(authors) = &self.authors {
            filter = filter.authors(authors.iter().copied());
        }
        if let Some(kinds) = &self.kinds {
            filter = filter.kinds(kinds.iter().copied());
        }
        if let Some(geohashes) = &self.geohashes {
            filter = filter.custom_tags(SingleLetterTag::lowercase(Alphabet::G), geohashes.clone());
        }
        if let Some(pubkeys) = &self.pubkeys {
            let hex: Vec<String> = pubkeys.iter().map(PublicKey::to_hex).collect();
            filter = filter.custom_tags(SingleLetterTag::lowercase(Alphabet::P), hex);
        }
        if let Some(since) = self.since {
            filter = filter.since(timestamp(since));
        }
        if let Some(until) = self.until {
            filter = filter.until(timestamp(until));
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}
