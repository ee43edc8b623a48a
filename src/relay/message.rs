// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relay wire messages.
//!
//! ```text
//! client -> relay: ["EVENT", event] | ["REQ", sub_id, filter] | ["CLOSE", sub_id]
//! relay -> client: ["EVENT", sub_id, event] | ["OK", event_id, accepted, message]
//!                  ["EOSE", sub_id] | ["NOTICE", message] | ["CLOSED", sub_id, message]
//! ```
//!
//! Framing is `nostr`'s; this module narrows relay messages down to the
//! frames a connection acts on.

use nostr::{ClientMessage, JsonUtil, RelayMessage, SubscriptionId};

use super::RelayError;
use crate::event::{Event, EventId};
use crate::filter::Filter;

pub fn event_frame(event: &Event) -> String {
    ClientMessage::event(event.clone()).as_json()
}

pub fn req_frame(subscription_id: &str, filter: &Filter) -> String {
    ClientMessage::req(SubscriptionId::new(subscription_id), filter.to_nostr()).as_json()
}

pub fn close_frame(subscription_id: &str) -> String {
    ClientMessage::close(SubscriptionId::new(subscription_id)).as_json()
}

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    /// Well-formed but not acted on (AUTH, COUNT, negentropy).
    Other,
}

pub fn decode(text: &str) -> Result<RelayFrame, RelayError> {
    let message = RelayMessage::from_json(text).map_err(|e| RelayError::Protocol(e.to_string()))?;
    Ok(match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => RelayFrame::Event {
            subscription_id: subscription_id.to_string(),
            event: Box::new(Event::clone(&event)),
        },
        RelayMessage::Ok {
            event_id,
            status,
            message,
        } => RelayFrame::Ok {
            event_id,
            accepted: status,
            message: message.to_string(),
        },
        RelayMessage::EndOfStoredEvents(subscription_id) => {
            RelayFrame::EndOfStoredEvents(subscription_id.to_string())
        }
        RelayMessage::Notice(message) => RelayFrame::Notice(message.to_string()),
        RelayMessage::Closed {
            subscription_id,
            message,
        } => RelayFrame::Closed {
            subscription_id: subscription_id.to_string(),
            message: message.to_string(),
        },
        _ => RelayFrame::Other,
    })
}
