// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Relay Pool
//!
//! One pool is built at startup and shared (behind `Arc`) by the channel
//! router, private messaging and the notification dispatcher.
//!
//! ## Publishing
//!
//! Every relay is tried concurrently with its own timeout. Individual
//! failures are logged and reported; the call only fails when no relay
//! accepted the event.
//!
//! ## Subscribing
//!
//! A subscription spawns one forwarding task per relay. Events are verified,
//! re-checked against the filter, de-duplicated by id across relays, and
//! delivered on one channel. When a relay stream ends the forwarder reopens
//! it with backoff, resuming from the newest event it saw. Closing (or
//! dropping) the [`Subscription`] cancels every forwarder.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use lru::LruCache;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{lock, RelayConnection, RelayError, RelayEvent, WebSocketRelay};
use crate::event::{unix_secs, verify_event, Event, EventId};
use crate::filter::Filter;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ids remembered per subscription for de-duplication.
const DEDUP_CAPACITY: usize = 4096;

const RESUBSCRIBE_MIN_BACKOFF: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of a publish that reached at least one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub accepted: Vec<String>,
    /// `(relay url, reason)` for every relay that failed.
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }
}

pub struct RelayPool {
    relays: Vec<Arc<dyn RelayConnection>>,
    publish_timeout: Duration,
}

impl RelayPool {
    pub fn new(relays: Vec<Arc<dyn RelayConnection>>) -> Self {
        Self {
            relays,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// WebSocket relays for each url.
    pub fn from_urls(urls: &[String], connect_timeout: Duration) -> Self {
        let relays = urls
            .iter()
            .map(|url| Arc::new(WebSocketRelay::new(url.clone(), connect_timeout)) as Arc<dyn RelayConnection>)
            .collect();
        Self::new(relays)
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url().to_string()).collect()
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Send `event` to every relay at once.
    ///
    /// Returns [`RelayError::NoRelayAccepted`] only when every relay failed.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport, RelayError> {
        let attempts = self.relays.iter().map(|relay| async move {
            let outcome = match tokio::time::timeout(self.publish_timeout, relay.publish(event)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RelayError::Timeout {
                    url: relay.url().to_string(),
                }),
            };
            (relay.url().to_string(), outcome)
        });

        let mut report = PublishReport {
            event_id: event.id.to_hex(),
            ..PublishReport::default()
        };
        for (url, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.accepted.push(url),
                Err(e) => {
                    tracing::warn!(relay = %url, event_id = %event.id.to_hex(), error = %e, "Relay publish failed");
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        if report.accepted.is_empty() {
            tracing::warn!(event_id = %event.id.to_hex(), attempted = self.relays.len(), "No relay accepted event");
            return Err(RelayError::NoRelayAccepted {
                attempted: self.relays.len(),
            });
        }

        tracing::info!(
            event_id = %event.id.to_hex(),
            kind = event.kind.as_u16(),
            accepted = report.accepted.len(),
            attempted = self.relays.len(),
            "Published event"
        );
        Ok(report)
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Subscribe on every relay. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(LruCache::new(
            NonZeroUsize::new(DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        )));
        let (deliveries, receiver) = mpsc::unbounded_channel();

        for relay in &self.relays {
            let forwarder = Forwarder {
                relay: relay.clone(),
                subscription_id: id.clone(),
                filter: filter.clone(),
                seen: seen.clone(),
                deliveries: deliveries.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(forwarder.run());
        }

        tracing::debug!(subscription = %id, relays = self.relays.len(), "Opened subscription");
        Subscription {
            id,
            relays: self.relays.len(),
            receiver,
            cancel,
        }
    }

    /// Collect stored events until every relay sent EOSE or `timeout` elapses.
    pub async fn query(&self, filter: Filter, timeout: Duration) -> Vec<Event> {
        let mut subscription = self.subscribe(filter);
        let mut events = Vec::new();
        let mut finished = 0;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while finished < subscription.relays {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!(subscription = %subscription.id, finished, "Query timed out");
                    break;
                }
                delivery = subscription.next_delivery() => match delivery {
                    Some(Delivery::Event(event)) => events.push(event),
                    Some(Delivery::EndOfStored) => finished += 1,
                    None => break,
                },
            }
        }
        subscription.close();
        events
    }
}

enum Delivery {
    Event(Event),
    /// One relay finished replaying stored events, could not be reached, or
    /// dropped the stream before finishing. Sent at most once per relay.
    EndOfStored,
}

struct Forwarder {
    relay: Arc<dyn RelayConnection>,
    subscription_id: String,
    filter: Filter,
    seen: Arc<Mutex<LruCache<EventId, ()>>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
}

/// Why a single relay stream stopped.
enum StreamEnd {
    Cancelled,
    Dropped,
}

impl Forwarder {
    async fn run(self) {
        let url = self.relay.url().to_string();
        let mut backoff = RESUBSCRIBE_MIN_BACKOFF;
        let mut newest_seen: Option<i64> = None;
        let mut reported_end = false;

        loop {
            let filter = match newest_seen {
                Some(newest) => self.filter.resume_from(newest),
                None => self.filter.clone(),
            };
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = self.relay.subscribe(&self.subscription_id, &filter) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    let mut reached_eose = false;
                    let end = loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                            next = stream.recv() => next,
                        };
                        match next {
                            Some(RelayEvent::Event(event)) => {
                                if let Some(created_at) = self.forward(&url, event) {
                                    newest_seen = Some(newest_seen.map_or(created_at, |n| n.max(created_at)));
                                }
                            }
                            Some(RelayEvent::EndOfStoredEvents) => {
                                reached_eose = true;
                                backoff = RESUBSCRIBE_MIN_BACKOFF;
                                if !reported_end {
                                    reported_end = true;
                                    let _ = self.deliveries.send(Delivery::EndOfStored);
                                }
                            }
                            None => break StreamEnd::Dropped,
                        }
                    };
                    if let StreamEnd::Cancelled = end {
                        self.relay.unsubscribe(&self.subscription_id).await;
                        return;
                    }
                    tracing::debug!(
                        relay = %url,
                        subscription = %self.subscription_id,
                        reached_eose,
                        "Relay stream ended"
                    );
                }
                Err(e) => {
                    tracing::warn!(relay = %url, error = %e, "Relay subscribe failed");
                }
            }

            if !reported_end {
                reported_end = true;
                let _ = self.deliveries.send(Delivery::EndOfStored);
            }

            tracing::debug!(
                relay = %url,
                subscription = %self.subscription_id,
                delay_ms = backoff.as_millis() as u64,
                "Resubscribing"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
        }
    }

    /// Deliver `event` if it is valid, matches and is new. Returns its
    /// `created_at` when it matched the filter.
    fn forward(&self, url: &str, event: Event) -> Option<i64> {
        if let Err(e) = verify_event(&event) {
            tracing::debug!(relay = %url, event_id = %event.id.to_hex(), error = %e, "Dropping invalid event");
            return None;
        }
        if !self.filter.matches(&event) {
            tracing::debug!(relay = %url, event_id = %event.id.to_hex(), "Dropping event outside the subscription filter");
            return None;
        }
        let created_at = unix_secs(event.created_at);
        let first_sighting = lock(&self.seen).put(event.id, ()).is_none();
        if !first_sighting {
            tracing::debug!(relay = %url, event_id = %event.id.to_hex(), "Duplicate event suppressed");
            return Some(created_at);
        }
        let _ = self.deliveries.send(Delivery::Event(event));
        Some(created_at)
    }
}

/// Handle to a pool-wide subscription. Dropping it closes the subscription.
pub struct Subscription {
    id: String,
    relays: usize,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next unique event from any relay; `None` once closed or every relay ended.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.next_delivery().await? {
                Delivery::Event(event) => return Some(event),
                Delivery::EndOfStored => continue,
            }
        }
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            delivery = self.receiver.recv() => delivery,
        }
    }

    /// Stop delivery and tear down every relay stream. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(subscription = %self.id, "Closing subscription");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that fires when this subscription closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
