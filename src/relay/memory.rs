// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process relay.
//!
//! Behaves like a public relay from the pool's point of view: stores
//! non-ephemeral events, replays matches on subscribe followed by EOSE, and
//! fans new events out to live subscriptions. Switches let callers take it
//! offline, make it reject events, or slow it down.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{lock, RelayConnection, RelayError, RelayEvent};
use crate::event::{verify_event, Event};
use crate::filter::Filter;

#[derive(Default)]
struct MemoryState {
    online: bool,
    rejection: Option<String>,
    publish_delay: Option<Duration>,
    stored: Vec<Event>,
    published: Vec<Event>,
    subscriptions: HashMap<String, (Filter, mpsc::UnboundedSender<RelayEvent>)>,
}

pub struct MemoryRelay {
    url: String,
    state: Mutex<MemoryState>,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(MemoryState {
                online: true,
                ..MemoryState::default()
            }),
        }
    }

    /// An offline relay refuses connections; existing subscriptions end.
    pub fn set_online(&self, online: bool) {
        let mut state = lock(&self.state);
        state.online = online;
        if !online {
            state.subscriptions.clear();
        }
    }

    /// Answer every publish with `OK false, reason`.
    pub fn reject_with(&self, reason: impl Into<String>) {
        lock(&self.state).rejection = Some(reason.into());
    }

    pub fn accept_all(&self) {
        lock(&self.state).rejection = None;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        lock(&self.state).publish_delay = Some(delay);
    }

    /// Events this relay accepted from publishers, in order.
    pub fn published(&self) -> Vec<Event> {
        lock(&self.state).published.clone()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// Deliver an event as if some other client had published it here.
    pub fn inject(&self, event: Event) {
        let mut state = lock(&self.state);
        Self::accept(&mut state, event);
    }

    fn accept(state: &mut MemoryState, event: Event) {
        state
            .subscriptions
            .retain(|_, (filter, route)| {
                if filter.matches(&event) {
                    route.send(RelayEvent::Event(event.clone())).is_ok()
                } else {
                    !route.is_closed()
                }
            });
        if !event.kind.is_ephemeral() {
            state.stored.push(event);
        }
    }

    fn offline_error(&self) -> RelayError {
        RelayError::Connect {
            url: self.url.clone(),
            reason: "relay offline".to_string(),
        }
    }
}

#[async_trait]
impl RelayConnection for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let delay = lock(&self.state).publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if !state.online {
            return Err(self.offline_error());
        }
        if let Some(reason) = state.rejection.clone() {
            return Err(RelayError::Rejected {
                url: self.url.clone(),
                reason,
            });
        }
        verify_event(event).map_err(|e| RelayError::Rejected {
            url: self.url.clone(),
            reason: format!("invalid: {e}"),
        })?;
        state.published.push(event.clone());
        Self::accept(&mut state, event.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: &Filter,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        let mut state = lock(&self.state);
        if !state.online {
            return Err(self.offline_error());
        }

        let (route, stream) = mpsc::unbounded_channel();
        let mut matching: Vec<&Event> = state
            .stored
            .iter()
            .filter(|event| filter.matches(event))
            .collect();
        // Relays return the newest stored events first when a limit applies.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        for event in matching {
            let _ = route.send(RelayEvent::Event(event.clone()));
        }
        let _ = route.send(RelayEvent::EndOfStoredEvents);

        state
            .subscriptions
            .insert(subscription_id.to_string(), (filter.clone(), route));
        Ok(stream)
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        lock(&self.state).subscriptions.remove(subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{location_chat_kind, sign_event, tag, Kind};
    use crate::keys::Keys;

    fn chat(keys: &Keys, geohash: &str, created_at: i64) -> Event {
        sign_event(keys, location_chat_kind(), vec![tag("g", geohash)], "hi", created_at).unwrap()
    }

    #[tokio::test]
    async fn replays_stored_then_streams_live() {
        let relay = MemoryRelay::new("memory://a");
        let keys = Keys::generate();
        let stored = sign_event(&keys, Kind::GiftWrap, vec![tag("p", "x")], "c", 5).unwrap();
        relay.publish(&stored).await.unwrap();

        let mut stream = relay
            .subscribe("s", &Filter::new().kinds([Kind::GiftWrap, location_chat_kind()]))
            .await
            .unwrap();
        assert_eq!(stream.recv().await, Some(RelayEvent::Event(stored)));
        assert_eq!(stream.recv().await, Some(RelayEvent::EndOfStoredEvents));

        let live = chat(&keys, "9q8yy", 6);
        relay.publish(&live).await.unwrap();
        assert_eq!(stream.recv().await, Some(RelayEvent::Event(live)));
    }

    #[tokio::test]
    async fn ephemeral_events_are_not_stored() {
        let relay = MemoryRelay::new("memory://a");
        relay.publish(&chat(&Keys::generate(), "9q8yy", 1)).await.unwrap();

        let mut stream = relay.subscribe("s", &Filter::new()).await.unwrap();
        assert_eq!(stream.recv().await, Some(RelayEvent::EndOfStoredEvents));
    }

    #[tokio::test]
    async fn offline_and_rejecting_relays_fail_publish() {
        let relay = MemoryRelay::new("memory://a");
        let event = chat(&Keys::generate(), "9q8yy", 1);

        relay.set_online(false);
        assert!(matches!(relay.publish(&event).await, Err(RelayError::Connect { .. })));
        assert!(relay.subscribe("s", &Filter::new()).await.is_err());

        relay.set_online(true);
        relay.reject_with("blocked");
        assert!(matches!(relay.publish(&event).await, Err(RelayError::Rejected { .. })));

        relay.accept_all();
        assert!(relay.publish(&event).await.is_ok());
        assert_eq!(relay.published(), vec![event]);
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream() {
        let relay = MemoryRelay::new("memory://a");
        let mut stream = relay.subscribe("s", &Filter::new()).await.unwrap();
        assert_eq!(stream.recv().await, Some(RelayEvent::EndOfStoredEvents));
        relay.unsubscribe("s").await;
        assert_eq!(relay.subscription_count(), 0);
        assert_eq!(stream.recv().await, None);
    }
}
