// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! A relay reached over WebSocket.
//!
//! The socket is opened lazily on first use and reopened after it drops.
//! One writer task owns the sink; one reader task routes incoming messages:
//!
//! - `EVENT` / `EOSE` to the matching subscription channel
//! - `OK` to the publish call waiting on that event id
//! - `NOTICE` to the log
//! - `CLOSED` ends the subscription
//!
//! When the socket closes, every pending publish fails and every
//! subscription stream ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::message::{close_frame, decode, event_frame, req_frame, RelayFrame};
use super::{lock, RelayConnection, RelayError, RelayEvent};
use crate::event::{Event, EventId};
use crate::filter::Filter;

type PendingAcks = Arc<Mutex<HashMap<EventId, oneshot::Sender<Result<(), String>>>>>;
type SubscriptionRoutes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RelayEvent>>>>;

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    subscriptions: SubscriptionRoutes,
    closed: CancellationToken,
}

impl Connection {
    fn send(&self, url: &str, text: String) -> Result<(), RelayError> {
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| RelayError::Closed {
                url: url.to_string(),
            })
    }
}

/// Removes a pending acknowledgement if the publish call is dropped early.
struct PendingGuard {
    pending: PendingAcks,
    event_id: EventId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.event_id);
    }
}

pub struct WebSocketRelay {
    url: String,
    connect_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, RelayError> {
        let mut slot = self.connection.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.closed.is_cancelled() {
                return Ok(existing.clone());
            }
        }

        let connection = Arc::new(self.open().await?);
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn open(&self) -> Result<Connection, RelayError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str()))
                .await
                .map_err(|_| RelayError::Timeout {
                    url: self.url.clone(),
                })?
                .map_err(|e| RelayError::Connect {
                    url: self.url.clone(),
                    reason: e.to_string(),
                })?;
        tracing::debug!(relay = %self.url, "Relay connected");

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingAcks = Arc::default();
        let subscriptions: SubscriptionRoutes = Arc::default();
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        let writer_url = self.url.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    next = outgoing_rx.recv() => {
                        let Some(message) = next else { break };
                        if let Err(e) = sink.send(message).await {
                            tracing::warn!(relay = %writer_url, error = %e, "Relay write failed");
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_url = self.url.clone();
        let reader_pending = pending.clone();
        let reader_subscriptions = subscriptions.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = source.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        route(&reader_url, &text, &reader_pending, &reader_subscriptions);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(relay = %reader_url, error = %e, "Relay read failed");
                        break;
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders fails waiting publishes and ends subscription streams.
            lock(&reader_pending).clear();
            lock(&reader_subscriptions).clear();
            tracing::debug!(relay = %reader_url, "Relay disconnected");
        });

        Ok(Connection {
            outgoing,
            pending,
            subscriptions,
            closed,
        })
    }
}

fn route(url: &str, text: &str, pending: &PendingAcks, subscriptions: &SubscriptionRoutes) {
    let frame = match decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(relay = %url, error = %e, "Ignoring relay message");
            return;
        }
    };

    match frame {
        RelayFrame::Event {
            subscription_id,
            event,
        } => {
            if let Some(route) = lock(subscriptions).get(&subscription_id) {
                let _ = route.send(RelayEvent::Event(*event));
            }
        }
        RelayFrame::EndOfStoredEvents(subscription_id) => {
            if let Some(route) = lock(subscriptions).get(&subscription_id) {
                let _ = route.send(RelayEvent::EndOfStoredEvents);
            }
        }
        RelayFrame::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(waiter) = lock(pending).remove(&event_id) {
                let _ = waiter.send(if accepted { Ok(()) } else { Err(message) });
            }
        }
        RelayFrame::Notice(notice) => {
            tracing::info!(relay = %url, notice = %notice, "Relay notice");
        }
        RelayFrame::Closed {
            subscription_id,
            message,
        } => {
            tracing::warn!(relay = %url, subscription = %subscription_id, reason = %message, "Relay closed subscription");
            lock(subscriptions).remove(&subscription_id);
        }
        RelayFrame::Other => {}
    }
}

#[async_trait]
impl RelayConnection for WebSocketRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let connection = self.connection().await?;
        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&connection.pending).insert(event.id, ack_tx);
        let _guard = PendingGuard {
            pending: connection.pending.clone(),
            event_id: event.id,
        };

        connection.send(&self.url, event_frame(event))?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(RelayError::Rejected {
                url: self.url.clone(),
                reason,
            }),
            Err(_) => Err(RelayError::Closed {
                url: self.url.clone(),
            }),
        }
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: &Filter,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, RelayError> {
        let connection = self.connection().await?;
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        lock(&connection.subscriptions).insert(subscription_id.to_string(), route_tx);

        if let Err(e) = connection.send(&self.url, req_frame(subscription_id, filter)) {
            lock(&connection.subscriptions).remove(subscription_id);
            return Err(e);
        }
        Ok(route_rx)
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        let connection = self.connection.lock().await.clone();
        let Some(connection) = connection else { return };
        if lock(&connection.subscriptions).remove(subscription_id).is_some() {
            let _ = connection.send(&self.url, close_frame(subscription_id));
        }
    }
}
