// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bridge client state machine.
//!
//! ```text
//!                connect()
//!   Disconnected ─────────┬── handshake acked ──────────► Bridge
//!        ▲                └── refused / timed out ──────► Nostr
//!        │                                                  │ ▲
//!        │        bridge socket lost: open relay feed ──────┘ │
//!        │        reconnect succeeds: close relay feed ───────┘
//!        └──────── disconnect() from any mode
//! ```
//!
//! While in nostr mode a background task retries the bridge every
//! `reconnect_interval`. Bridge frames written before a link has been
//! acknowledged are queued and flushed in order once it is.
//!
//! Every `disconnect()` bumps a teardown epoch. Attempts started under an
//! older epoch never install a link, open a relay feed or schedule a
//! reconnect, so a disconnect during a handshake sticks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    BridgeMessage, BridgeMessageType, ChatMessagePayload, ChatReceivedPayload, DevicePayload,
    HandshakeAck, HandshakePayload, MeshStatus, NearbyDevice, CLIENT_NAME, PROTOCOL_VERSION,
};
use crate::channel::{ChannelError, ChannelMessage, ChannelRouter, ChannelSubscription};
use crate::event::unix_now;
use crate::identity::{Identity, IdentityManager, IdentityScope};
use crate::relay::lock;

pub const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Timeout for [`BridgeClient::is_bridge_available`].
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    /// Covers socket open and handshake acknowledgement.
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BRIDGE_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Bridge,
    Nostr,
    Disconnected,
}

/// Everything the client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A chat line, from the mesh or from relays.
    Message(ChannelMessage),
    MeshStatus(MeshStatus),
    DeviceFound(NearbyDevice),
    DeviceLeft(String),
    /// An error frame from the bridge.
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("not connected")]
    NotConnected,

    #[error("a bridge connection attempt is already running")]
    AlreadyConnecting,

    #[error("failed to reach bridge: {0}")]
    Connect(String),

    #[error("bridge did not acknowledge the handshake in time")]
    Timeout,

    #[error("bridge rejected the handshake: {0}")]
    HandshakeRejected(String),

    #[error("bridge closed the connection")]
    Closed,

    #[error("invalid bridge frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

type AckWaiter = oneshot::Sender<Result<HandshakeAck, String>>;

struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    /// Set once the bridge acknowledged our handshake.
    ready: bool,
    closed: CancellationToken,
}

struct ReconnectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    /// Incremented by every `disconnect()`.
    epoch: u64,
    link: Option<Link>,
    next_generation: u64,
    connecting: bool,
    pending_ack: Option<(u64, AckWaiter)>,
    handshake: Option<HandshakeAck>,
    queue: VecDeque<BridgeMessage>,
    relay_feed: Option<CancellationToken>,
    reconnect: Option<ReconnectTask>,
}

struct Shared {
    config: BridgeConfig,
    channel: String,
    identity: Identity,
    router: ChannelRouter,
    events: mpsc::UnboundedSender<BridgeEvent>,
    mode: watch::Sender<ConnectionMode>,
    state: Mutex<LinkState>,
}

pub struct BridgeClient {
    shared: Arc<Shared>,
}

impl BridgeClient {
    /// Client for `channel`, signing relay traffic with that channel's region identity.
    pub fn new(
        config: BridgeConfig,
        channel: impl Into<String>,
        identities: &IdentityManager,
        router: ChannelRouter,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let channel = channel.into();
        let identity = identities.get_or_create(&IdentityScope::for_geohash(&channel));
        let (events, events_rx) = mpsc::unbounded_channel();
        let (mode, _) = watch::channel(ConnectionMode::Disconnected);

        let shared = Arc::new(Shared {
            config,
            channel,
            identity,
            router,
            events,
            mode,
            state: Mutex::new(LinkState::default()),
        });
        (Self { shared }, events_rx)
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.shared.mode.borrow()
    }

    pub fn watch_mode(&self) -> watch::Receiver<ConnectionMode> {
        self.shared.mode.subscribe()
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Last handshake acknowledgement, with the radio state and peer count.
    pub fn handshake(&self) -> Option<HandshakeAck> {
        lock(&self.shared.state).handshake.clone()
    }

    /// Try the bridge first and fall back to relays.
    ///
    /// Never fails; the returned mode says which transport is in use. When
    /// already connected this returns the current mode without side effects.
    pub async fn connect(&self) -> ConnectionMode {
        let current = self.mode();
        if current != ConnectionMode::Disconnected {
            return current;
        }

        tracing::info!(url = %self.shared.config.url, channel = %self.shared.channel, "Connecting to bridge");
        let epoch = lock(&self.shared.state).epoch;
        match try_bridge(&self.shared, epoch).await {
            Ok(ack) => {
                tracing::info!(
                    radio_enabled = ack.radio_enabled,
                    peers = ack.peer_count,
                    "Bridge connected"
                );
            }
            Err(e) => {
                tracing::info!(error = %e, "Bridge unavailable, using relays");
                fall_back_to_relays(&self.shared, epoch);
            }
        }
        self.mode()
    }

    /// Send a chat line over whichever transport is active.
    pub async fn send_message(&self, content: &str) -> Result<(), BridgeError> {
        match self.mode() {
            ConnectionMode::Bridge => {
                let payload = ChatMessagePayload {
                    content: content.to_string(),
                    geohash: self.shared.channel.clone(),
                    pubkey: self.shared.identity.public_key().to_hex(),
                    timestamp: unix_now(),
                };
                send_bridge_message(&self.shared, BridgeMessage::new(BridgeMessageType::ChatMessage, payload)?);
                Ok(())
            }
            ConnectionMode::Nostr => {
                self.shared
                    .router
                    .send_to_channel(&self.shared.identity, &self.shared.channel, content, Vec::new())
                    .await?;
                Ok(())
            }
            ConnectionMode::Disconnected => Err(BridgeError::NotConnected),
        }
    }

    /// Ask the bridge for a [`BridgeEvent::MeshStatus`]. Bridge mode only.
    pub fn request_mesh_status(&self) -> Result<(), BridgeError> {
        if self.mode() != ConnectionMode::Bridge {
            return Err(BridgeError::NotConnected);
        }
        let request = BridgeMessage::new(BridgeMessageType::MeshStatus, serde_json::json!({}))?;
        send_bridge_message(&self.shared, request);
        Ok(())
    }

    /// Stop reconnecting, close both transports and enter `Disconnected`.
    ///
    /// Queued bridge frames are kept for the next connection.
    pub async fn disconnect(&self) {
        let reconnect = {
            let mut state = lock(&self.shared.state);
            state.epoch += 1;
            state.reconnect.take()
        };
        if let Some(task) = reconnect {
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        set_mode(&self.shared, ConnectionMode::Disconnected);
        let (link, feed) = {
            let mut state = lock(&self.shared.state);
            state.pending_ack = None;
            (state.link.take(), state.relay_feed.take())
        };
        if let Some(link) = link {
            link.closed.cancel();
        }
        if let Some(feed) = feed {
            feed.cancel();
        }
        tracing::info!(channel = %self.shared.channel, "Bridge client disconnected");
    }

    /// Whether something at `url` accepts a WebSocket within one second.
    pub async fn is_bridge_available(url: &str) -> bool {
        match tokio::time::timeout(AVAILABILITY_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((mut stream, _))) => {
                let _ = stream.close(None).await;
                true
            }
            _ => false,
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        if let Some(task) = state.reconnect.take() {
            task.cancel.cancel();
        }
        if let Some(link) = state.link.take() {
            link.closed.cancel();
        }
        if let Some(feed) = state.relay_feed.take() {
            feed.cancel();
        }
    }
}

// =============================================================================
// Transitions
// =============================================================================

fn set_mode(shared: &Shared, mode: ConnectionMode) {
    let changed = shared.mode.send_if_modified(|current| {
        if *current == mode {
            return false;
        }
        *current = mode;
        true
    });
    if changed {
        tracing::info!(channel = %shared.channel, mode = ?mode, "Connection mode changed");
    }
}

/// Switch to relays unless the client was disconnected since `epoch`.
fn fall_back_to_relays(shared: &Arc<Shared>, epoch: u64) {
    let subscription = shared.router.subscribe_to_channel(&shared.channel, false);
    let mut state = lock(&shared.state);
    if state.epoch != epoch {
        tracing::debug!(channel = %shared.channel, "Disconnected during attempt, not falling back");
        subscription.close();
        return;
    }
    start_relay_feed(shared, &mut state, subscription);
    set_mode(shared, ConnectionMode::Nostr);
    schedule_reconnect(shared, &mut state, epoch);
}

/// Forward relay messages for the channel to the event stream.
fn start_relay_feed(shared: &Shared, state: &mut LinkState, mut subscription: ChannelSubscription) {
    let cancel = CancellationToken::new();
    if let Some(previous) = state.relay_feed.replace(cancel.clone()) {
        previous.cancel();
    }

    let events = shared.events.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.recv() => {
                    let Some(message) = next else { break };
                    if events.send(BridgeEvent::Message(message)).is_err() {
                        break;
                    }
                }
            }
        }
        subscription.close();
    });
}

fn stop_relay_feed(state: &mut LinkState) {
    if let Some(feed) = state.relay_feed.take() {
        feed.cancel();
    }
}

fn schedule_reconnect(shared: &Arc<Shared>, state: &mut LinkState, epoch: u64) {
    if state.epoch != epoch || state.reconnect.is_some() {
        return;
    }
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(reconnect_loop(shared.clone(), cancel.clone(), epoch));
    state.reconnect = Some(ReconnectTask { cancel, handle });
}

async fn reconnect_loop(shared: Arc<Shared>, cancel: CancellationToken, epoch: u64) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(shared.config.reconnect_interval) => {}
        }
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = try_bridge(&shared, epoch) => attempt,
        };
        match attempt {
            Ok(_) => {
                tracing::info!(channel = %shared.channel, "Bridge reconnected");
                return;
            }
            Err(e) => tracing::debug!(error = %e, "Bridge reconnect attempt failed"),
        }
    }
}

/// Clears the in-progress flag when an attempt ends, however it ends.
struct ConnectingGuard<'a>(&'a Shared);

impl<'a> ConnectingGuard<'a> {
    fn acquire(shared: &'a Shared) -> Result<(Self, u64), BridgeError> {
        let mut state = lock(&shared.state);
        if state.connecting {
            return Err(BridgeError::AlreadyConnecting);
        }
        state.connecting = true;
        state.next_generation += 1;
        Ok((Self(shared), state.next_generation))
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).connecting = false;
    }
}

/// One bridge attempt: open, handshake, wait for the ack.
///
/// On success the link is live and the mode is `Bridge`.
async fn try_bridge(shared: &Arc<Shared>, epoch: u64) -> Result<HandshakeAck, BridgeError> {
    let (_guard, generation) = ConnectingGuard::acquire(shared)?;
    let opening = open_link(shared, generation, epoch);
    let result = match tokio::time::timeout(shared.config.connect_timeout, opening).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout),
    };
    if result.is_err() {
        discard_link(shared, generation);
    }
    result
}

fn discard_link(shared: &Shared, generation: u64) {
    let mut state = lock(&shared.state);
    if state.link.as_ref().is_some_and(|l| l.generation == generation) {
        if let Some(link) = state.link.take() {
            link.closed.cancel();
        }
    }
    if state.pending_ack.as_ref().is_some_and(|(g, _)| *g == generation) {
        state.pending_ack = None;
    }
}

async fn open_link(shared: &Arc<Shared>, generation: u64, epoch: u64) -> Result<HandshakeAck, BridgeError> {
    let (stream, _response) = tokio_tungstenite::connect_async(shared.config.url.as_str())
        .await
        .map_err(|e| BridgeError::Connect(e.to_string()))?;
    let (sink, source) = stream.split();
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let closed = CancellationToken::new();
    let (ack_tx, ack_rx) = oneshot::channel();

    let handshake = BridgeMessage::new(
        BridgeMessageType::Handshake,
        HandshakePayload {
            version: PROTOCOL_VERSION.to_string(),
            geohash: shared.channel.clone(),
            pubkey: shared.identity.public_key().to_hex(),
            client: CLIENT_NAME.to_string(),
        },
    )?;
    // The handshake goes straight out; everything else waits for the ack.
    let _ = outgoing.send(Message::Text(handshake.to_json()?.into()));

    {
        let mut state = lock(&shared.state);
        if state.epoch != epoch {
            closed.cancel();
            return Err(BridgeError::Closed);
        }
        if let Some(stale) = state.link.replace(Link {
            generation,
            outgoing,
            ready: false,
            closed: closed.clone(),
        }) {
            stale.closed.cancel();
        }
        state.pending_ack = Some((generation, ack_tx));
    }

    tokio::spawn(write_frames(sink, outgoing_rx, closed.clone()));
    tokio::spawn(read_frames(shared.clone(), source, generation, closed));

    match ack_rx.await {
        Ok(Ok(ack)) => Ok(ack),
        Ok(Err(reason)) => Err(BridgeError::HandshakeRejected(reason)),
        Err(_) => Err(BridgeError::Closed),
    }
}

/// Write now if the link is acknowledged, otherwise queue.
fn send_bridge_message(shared: &Shared, message: BridgeMessage) {
    let mut state = lock(&shared.state);
    let state = &mut *state;
    if let Some(link) = state.link.as_ref().filter(|l| l.ready) {
        match message.to_json() {
            Ok(text) => {
                if link.outgoing.send(Message::Text(text.into())).is_ok() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unencodable bridge frame");
                return;
            }
        }
    }
    tracing::debug!(kind = ?message.kind, queued = state.queue.len() + 1, "Queueing bridge frame");
    state.queue.push_back(message);
}

// =============================================================================
// Socket tasks
// =============================================================================

async fn write_frames<S>(mut sink: S, mut outgoing: mpsc::UnboundedReceiver<Message>, closed: CancellationToken)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            next = outgoing.recv() => {
                let Some(message) = next else { break };
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "Bridge write failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    closed.cancel();
}

async fn read_frames<S>(shared: Arc<Shared>, mut source: S, generation: u64, closed: CancellationToken)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match BridgeMessage::from_json(&text) {
                Ok(message) => handle_frame(&shared, generation, message),
                Err(e) => tracing::debug!(error = %e, "Ignoring bridge frame"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Bridge read failed");
                break;
            }
        }
    }
    closed.cancel();
    link_closed(&shared, generation);
}

fn link_closed(shared: &Arc<Shared>, generation: u64) {
    let (was_live, epoch) = {
        let mut state = lock(&shared.state);
        if state.pending_ack.as_ref().is_some_and(|(g, _)| *g == generation) {
            state.pending_ack = None;
        }
        let was_live = match state.link.take_if(|l| l.generation == generation) {
            Some(link) => link.ready,
            None => false,
        };
        (was_live, state.epoch)
    };
    if was_live && *shared.mode.borrow() == ConnectionMode::Bridge {
        tracing::warn!(channel = %shared.channel, "Bridge connection lost, switching to relays");
        fall_back_to_relays(shared, epoch);
    }
}

fn handle_frame(shared: &Arc<Shared>, generation: u64, message: BridgeMessage) {
    match message.kind {
        BridgeMessageType::HandshakeAck => {
            let ack: HandshakeAck = match message.payload_as() {
                Ok(ack) => ack,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed handshake ack");
                    HandshakeAck::default()
                }
            };
            acknowledge(shared, generation, ack);
        }
        BridgeMessageType::ChatReceived => match message.payload_as::<ChatReceivedPayload>() {
            Ok(chat) => {
                let message = ChannelMessage {
                    id: chat.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    content: chat.content,
                    pubkey: chat.pubkey,
                    timestamp: chat.timestamp.unwrap_or_else(unix_now),
                    geohash: chat.geohash.unwrap_or_else(|| shared.channel.clone()),
                    tags: chat.tags.unwrap_or_default(),
                };
                let _ = shared.events.send(BridgeEvent::Message(message));
            }
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed chat frame"),
        },
        BridgeMessageType::MeshStatus => match message.payload_as::<MeshStatus>() {
            Ok(status) => {
                let _ = shared.events.send(BridgeEvent::MeshStatus(status));
            }
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed mesh status"),
        },
        BridgeMessageType::DeviceJoined | BridgeMessageType::NearbyDevices => {
            let payload: DevicePayload = message.payload_as().unwrap_or_default();
            for device in payload.device.into_iter().chain(payload.devices) {
                let _ = shared.events.send(BridgeEvent::DeviceFound(device));
            }
        }
        BridgeMessageType::DeviceLeft => {
            let payload: DevicePayload = message.payload_as().unwrap_or_default();
            if let Some(device) = payload.device {
                let _ = shared.events.send(BridgeEvent::DeviceLeft(device.id));
            }
        }
        BridgeMessageType::Ping => {
            if let Ok(pong) = BridgeMessage::new(BridgeMessageType::Pong, serde_json::json!({})) {
                send_bridge_message(shared, pong);
            }
        }
        BridgeMessageType::Error => {
            let reason = message
                .payload
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| message.payload.to_string());
            let waiter = {
                let mut state = lock(&shared.state);
                state.pending_ack.take_if(|(g, _)| *g == generation)
            };
            match waiter {
                Some((_, waiter)) => {
                    let _ = waiter.send(Err(reason));
                }
                None => {
                    tracing::warn!(error = %reason, "Bridge reported an error");
                    let _ = shared.events.send(BridgeEvent::Error(reason));
                }
            }
        }
        BridgeMessageType::Pong => tracing::trace!("Bridge pong"),
        BridgeMessageType::Handshake | BridgeMessageType::ChatMessage => {
            tracing::debug!(kind = ?message.kind, "Ignoring client-only frame from bridge");
        }
    }
}

/// Mark the link live, flush queued frames in order and switch to bridge mode.
fn acknowledge(shared: &Shared, generation: u64, ack: HandshakeAck) {
    let mut guard = lock(&shared.state);
    let state = &mut *guard;
    let Some(link) = state.link.as_mut().filter(|l| l.generation == generation) else {
        return;
    };
    link.ready = true;

    let queued = state.queue.len();
    while let Some(message) = state.queue.pop_front() {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unencodable bridge frame");
                continue;
            }
        };
        if link.outgoing.send(Message::Text(text.into())).is_err() {
            state.queue.push_front(message);
            break;
        }
    }
    if queued > 0 {
        tracing::debug!(flushed = queued - state.queue.len(), "Flushed queued bridge frames");
    }

    state.handshake = Some(ack.clone());
    stop_relay_feed(state);
    // A live link ends any reconnect loop; a later loss schedules a fresh one.
    if let Some(task) = state.reconnect.take() {
        task.cancel.cancel();
    }
    set_mode(shared, ConnectionMode::Bridge);
    if let Some((_, waiter)) = state.pending_ack.take_if(|(g, _)| *g == generation) {
        let _ = waiter.send(Ok(ack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    use crate::event::{first_tag_value, location_chat_kind, sign_event, tag};
    use crate::keys::Keys;
    use crate::relay::{MemoryRelay, RelayConnection, RelayPool};

    const CHANNEL: &str = "9q8yy";
    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Clone, Copy, PartialEq)]
    enum Script {
        /// Acknowledge every handshake.
        AckAll,
        /// Leave the first handshake unanswered.
        IgnoreFirst,
        /// Drop the first connection after its first chat frame.
        DropFirstAfterChat,
        /// Never acknowledge.
        Silent,
    }

    struct FakeBridge {
        url: String,
        /// Every frame the bridge received, in order.
        inbox: mpsc::UnboundedReceiver<BridgeMessage>,
        /// Frames pushed to whichever client is connected.
        push: mpsc::UnboundedSender<BridgeMessage>,
    }

    impl FakeBridge {
        async fn spawn(script: Script) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let (push, mut push_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                let mut index = 0;
                // One client at a time, so pushes always reach the live connection.
                while let Ok((stream, _)) = listener.accept().await {
                    serve(stream, index, script, &inbox_tx, &mut push_rx).await;
                    index += 1;
                }
            });
            Self {
                url: format!("ws://{addr}"),
                inbox,
                push,
            }
        }

        async fn next_frame(&mut self) -> BridgeMessage {
            tokio::time::timeout(WAIT, self.inbox.recv()).await.unwrap().unwrap()
        }

        async fn next_of(&mut self, kind: BridgeMessageType) -> BridgeMessage {
            loop {
                let frame = self.next_frame().await;
                if frame.kind == kind {
                    return frame;
                }
            }
        }
    }

    async fn serve(
        stream: TcpStream,
        index: usize,
        script: Script,
        inbox: &mpsc::UnboundedSender<BridgeMessage>,
        push: &mut mpsc::UnboundedReceiver<BridgeMessage>,
    ) {
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        loop {
            tokio::select! {
                frame = ws.next() => {
                    let Some(Ok(Message::Text(text))) = frame else { return };
                    let frame = BridgeMessage::from_json(&text).unwrap();
                    let _ = inbox.send(frame.clone());
                    match frame.kind {
                        BridgeMessageType::Handshake => {
                            let silent = script == Script::Silent || (script == Script::IgnoreFirst && index == 0);
                            if !silent {
                                let ack = HandshakeAck { version: PROTOCOL_VERSION.to_string(), radio_enabled: true, peer_count: 3 };
                                reply(&mut ws, BridgeMessageType::HandshakeAck, ack).await;
                            }
                        }
                        BridgeMessageType::ChatMessage if script == Script::DropFirstAfterChat && index == 0 => return,
                        BridgeMessageType::MeshStatus => {
                            let status = MeshStatus { is_connected: true, bluetooth_enabled: true, device_count: 2, devices: vec![] };
                            reply(&mut ws, BridgeMessageType::MeshStatus, status).await;
                        }
                        _ => {}
                    }
                }
                Some(frame) = push.recv() => {
                    ws.send(Message::Text(frame.to_json().unwrap().into())).await.unwrap();
                }
            }
        }
    }

    async fn reply(ws: &mut WebSocketStream<TcpStream>, kind: BridgeMessageType, payload: impl Serialize) {
        let frame = BridgeMessage::new(kind, payload).unwrap();
        ws.send(Message::Text(frame.to_json().unwrap().into())).await.unwrap();
    }

    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    fn client_for(url: &str, relay: &Arc<MemoryRelay>) -> (BridgeClient, mpsc::UnboundedReceiver<BridgeEvent>) {
        let pool = RelayPool::new(vec![relay.clone() as Arc<dyn RelayConnection>]);
        let config = BridgeConfig {
            url: url.to_string(),
            connect_timeout: Duration::from_millis(300),
            reconnect_interval: Duration::from_millis(300),
        };
        BridgeClient::new(
            config,
            CHANNEL,
            &IdentityManager::without_storage(),
            ChannelRouter::new(Arc::new(pool)),
        )
    }

    async fn wait_for_mode(client: &BridgeClient, mode: ConnectionMode) {
        let mut rx = client.watch_mode();
        tokio::time::timeout(WAIT, rx.wait_for(|m| *m == mode))
            .await
            .unwrap()
            .unwrap();
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn connects_through_bridge_and_exchanges_chat() {
        let mut bridge = FakeBridge::spawn(Script::AckAll).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, mut events) = client_for(&bridge.url, &relay);

        assert_eq!(client.connect().await, ConnectionMode::Bridge);
        assert_eq!(client.mode(), ConnectionMode::Bridge);
        let ack = client.handshake().unwrap();
        assert!(ack.radio_enabled);
        assert_eq!(ack.peer_count, 3);

        let handshake: HandshakePayload = bridge.next_frame().await.payload_as().unwrap();
        assert_eq!(handshake.version, "1.0.0");
        assert_eq!(handshake.geohash, CHANNEL);
        assert_eq!(handshake.pubkey, client.identity().public_key().to_hex());

        client.send_message("hello mesh").await.unwrap();
        let chat: ChatMessagePayload = bridge.next_of(BridgeMessageType::ChatMessage).await.payload_as().unwrap();
        assert_eq!(chat.content, "hello mesh");
        assert_eq!(chat.geohash, CHANNEL);
        assert!(relay.published().is_empty());

        let incoming = BridgeMessage::new(
            BridgeMessageType::ChatReceived,
            serde_json::json!({"content": "from a phone", "pubkey": "abc", "source": "bluetooth"}),
        )
        .unwrap();
        bridge.push.send(incoming).unwrap();
        match next_event(&mut events).await {
            BridgeEvent::Message(message) => {
                assert_eq!(message.content, "from a phone");
                assert_eq!(message.geohash, CHANNEL);
                assert!(!message.id.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }

        client.disconnect().await;
    }

    #[tokio::test]
    async fn falls_back_to_relays_when_handshake_is_never_acknowledged() {
        let mut bridge = FakeBridge::spawn(Script::Silent).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, mut events) = client_for(&bridge.url, &relay);

        assert_eq!(client.connect().await, ConnectionMode::Nostr);
        bridge.next_of(BridgeMessageType::Handshake).await;

        // Relay feed is live.
        while relay.subscription_count() == 0 {
            tokio::task::yield_now().await;
        }
        let other = Keys::generate();
        let posted = sign_event(
            &other,
            location_chat_kind(),
            vec![tag("g", CHANNEL)],
            "seen on relays",
            unix_now(),
        )
        .unwrap();
        relay.inject(posted.clone());
        match next_event(&mut events).await {
            BridgeEvent::Message(message) => assert_eq!(message.id, posted.id.to_hex()),
            other => panic!("unexpected event {other:?}"),
        }

        client.send_message("via relays").await.unwrap();
        let published = relay.published();
        let sent = published.iter().find(|e| e.content == "via relays").unwrap();
        assert_eq!(sent.kind.as_u16(), 20000);
        assert_eq!(first_tag_value(sent.tags.iter(), "g"), Some(CHANNEL));
        assert_eq!(sent.pubkey, client.identity().public_key());

        client.disconnect().await;
    }

    #[tokio::test]
    async fn falls_back_to_relays_when_nothing_listens() {
        let url = closed_port_url().await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, _events) = client_for(&url, &relay);

        assert_eq!(client.connect().await, ConnectionMode::Nostr);
        assert!(client.request_mesh_status().is_err());
        client.disconnect().await;
        assert_eq!(client.mode(), ConnectionMode::Disconnected);
    }

    #[tokio::test]
    async fn disconnected_client_rejects_sends() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, _events) = client_for(&closed_port_url().await, &relay);

        assert!(matches!(client.send_message("x").await, Err(BridgeError::NotConnected)));

        client.connect().await;
        client.disconnect().await;
        assert!(matches!(client.send_message("x").await, Err(BridgeError::NotConnected)));
        assert!(relay.published().is_empty());
    }

    #[tokio::test]
    async fn reconnect_flushes_queued_frames_in_order() {
        let mut bridge = FakeBridge::spawn(Script::IgnoreFirst).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, _events) = client_for(&bridge.url, &relay);

        assert_eq!(client.connect().await, ConnectionMode::Nostr);
        for content in ["first", "second"] {
            let payload = ChatMessagePayload {
                content: content.to_string(),
                geohash: CHANNEL.to_string(),
                pubkey: client.identity().public_key().to_hex(),
                timestamp: unix_now(),
            };
            send_bridge_message(
                &client.shared,
                BridgeMessage::new(BridgeMessageType::ChatMessage, payload).unwrap(),
            );
        }
        assert_eq!(lock(&client.shared.state).queue.len(), 2);

        wait_for_mode(&client, ConnectionMode::Bridge).await;
        assert!(lock(&client.shared.state).queue.is_empty());
        assert!(lock(&client.shared.state).relay_feed.is_none());

        // First connection: unanswered handshake. Second: handshake then the queue.
        assert_eq!(bridge.next_frame().await.kind, BridgeMessageType::Handshake);
        assert_eq!(bridge.next_frame().await.kind, BridgeMessageType::Handshake);
        let first: ChatMessagePayload = bridge.next_frame().await.payload_as().unwrap();
        let second: ChatMessagePayload = bridge.next_frame().await.payload_as().unwrap();
        assert_eq!((first.content.as_str(), second.content.as_str()), ("first", "second"));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn lost_bridge_switches_to_relays_then_back() {
        let mut bridge = FakeBridge::spawn(Script::DropFirstAfterChat).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, _events) = client_for(&bridge.url, &relay);

        assert_eq!(client.connect().await, ConnectionMode::Bridge);
        client.send_message("last words").await.unwrap();
        bridge.next_of(BridgeMessageType::ChatMessage).await;

        wait_for_mode(&client, ConnectionMode::Nostr).await;
        wait_for_mode(&client, ConnectionMode::Bridge).await;
        client.send_message("back again").await.unwrap();
        let chat: ChatMessagePayload = bridge.next_of(BridgeMessageType::ChatMessage).await.payload_as().unwrap();
        assert_eq!(chat.content, "back again");

        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_stops_reconnecting() {
        let mut bridge = FakeBridge::spawn(Script::Silent).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, _events) = client_for(&bridge.url, &relay);

        assert_eq!(client.connect().await, ConnectionMode::Nostr);
        bridge.next_of(BridgeMessageType::Handshake).await;
        client.disconnect().await;
        assert!(lock(&client.shared.state).reconnect.is_none());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(client.mode(), ConnectionMode::Disconnected);
        assert!(bridge.inbox.try_recv().is_err(), "client kept dialing after disconnect");
    }

    #[tokio::test]
    async fn disconnect_during_handshake_stays_disconnected() {
        let mut bridge = FakeBridge::spawn(Script::Silent).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let pool = RelayPool::new(vec![relay.clone() as Arc<dyn RelayConnection>]);
        let config = BridgeConfig {
            url: bridge.url.clone(),
            connect_timeout: Duration::from_secs(2),
            reconnect_interval: Duration::from_millis(300),
        };
        let (client, _events) = BridgeClient::new(
            config,
            CHANNEL,
            &IdentityManager::without_storage(),
            ChannelRouter::new(Arc::new(pool)),
        );

        let (mode, ()) = tokio::join!(client.connect(), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.disconnect().await;
        });
        assert_eq!(mode, ConnectionMode::Disconnected);
        bridge.next_of(BridgeMessageType::Handshake).await;

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(client.mode(), ConnectionMode::Disconnected);
        {
            let state = lock(&client.shared.state);
            assert!(state.reconnect.is_none());
            assert!(state.relay_feed.is_none());
            assert!(state.link.is_none());
        }
        assert!(bridge.inbox.try_recv().is_err(), "client kept dialing after disconnect");
    }

    #[tokio::test]
    async fn reports_mesh_status_and_devices() {
        let mut bridge = FakeBridge::spawn(Script::AckAll).await;
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let (client, mut events) = client_for(&bridge.url, &relay);
        assert_eq!(client.connect().await, ConnectionMode::Bridge);

        client.request_mesh_status().unwrap();
        bridge.next_of(BridgeMessageType::MeshStatus).await;
        match next_event(&mut events).await {
            BridgeEvent::MeshStatus(status) => assert_eq!(status.device_count, 2),
            other => panic!("unexpected event {other:?}"),
        }

        let joined = BridgeMessage::new(
            BridgeMessageType::DeviceJoined,
            serde_json::json!({"device": {"id": "d1", "name": "Phone", "rssi": -58, "lastSeen": 1, "isBitchat": true}}),
        )
        .unwrap();
        bridge.push.send(joined).unwrap();
        match next_event(&mut events).await {
            BridgeEvent::DeviceFound(device) => {
                assert_eq!(device.id, "d1");
                assert!(device.is_bitchat);
            }
            other => panic!("unexpected event {other:?}"),
        }

        client.disconnect().await;
    }

    #[tokio::test]
    async fn detects_bridge_availability() {
        let bridge = FakeBridge::spawn(Script::AckAll).await;
        assert!(BridgeClient::is_bridge_available(&bridge.url).await);
        assert!(!BridgeClient::is_bridge_available(&closed_port_url().await).await);
    }
}
