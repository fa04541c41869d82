//! Connection lifecycle and frame routing.
//!
//! One [`Connection`] owns at most one live [`FrameLink`] at a time and
//! presents a small surface: `connect`, `disconnect`, diagram channel
//! management, and publishing. Inbound frames are decoded off the link by
//! a reader task and surfaced as [`ConnEvent`]s on a single channel the
//! client drains.
//!
//! Reconnection is not decided here. When the link dies the reader marks
//! the connection `Disconnected` and emits [`ConnEvent::Disconnected`];
//! the client's health loop calls `connect()` again, which replays the
//! personal queues and the current diagram's subscriptions so a recovered
//! session looks identical to a fresh join.
//!
//! Teardown is epoch-guarded: every established link gets a generation
//! number, and a reader only marks the connection down if its generation
//! is still current. A stale reader from a torn-down link can therefore
//! never clobber the state of its replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::{CollabError, EventKind, WireEvent};
use crate::presence::PresenceSnapshot;
use crate::transport::{Frame, FrameCommand, FrameTransport};

/// Personal queue delivering direct messages to this session.
pub const PERSONAL_QUEUE: &str = "/user/queue/messages";
/// Personal queue delivering latency probe replies.
pub const PONG_QUEUE: &str = "/user/queue/pong";
/// Destination for latency probes.
pub const PING_DEST: &str = "/app/ping";

pub fn events_topic(diagram_id: Uuid) -> String {
    format!("/topic/diagram/{diagram_id}/events")
}

pub fn presence_topic(diagram_id: Uuid) -> String {
    format!("/topic/diagram/{diagram_id}/presence")
}

pub fn cursors_topic(diagram_id: Uuid) -> String {
    format!("/topic/diagram/{diagram_id}/cursors")
}

pub fn join_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/join")
}

pub fn leave_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/leave")
}

pub fn event_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/event")
}

pub fn cursor_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/cursor")
}

pub fn selection_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/selection")
}

pub fn lock_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/lock")
}

pub fn unlock_dest(diagram_id: Uuid) -> String {
    format!("/app/diagram/{diagram_id}/unlock")
}

/// Split `/topic/diagram/{id}/{channel}` into its id and channel.
fn parse_diagram_topic(destination: &str) -> Option<(Uuid, &str)> {
    let rest = destination.strip_prefix("/topic/diagram/")?;
    let (id, channel) = rest.split_once('/')?;
    Some((Uuid::parse_str(id).ok()?, channel))
}

/// Supplies the bearer token presented during the handshake.
///
/// Returning `None` means no credential is available; `connect()` fails
/// with [`CollabError::AuthRequired`] and the health loop tears down any
/// live session.
pub trait TokenProvider: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

/// A fixed token, for sessions whose credential never rotates.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A settable token, for sessions where the credential can appear,
/// rotate, or be revoked at runtime.
#[derive(Default)]
pub struct SharedToken {
    inner: StdMutex<Option<String>>,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: StdMutex::new(Some(token.into())),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = None;
        }
    }
}

impl TokenProvider for SharedToken {
    fn token(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|g| g.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the connection surfaces to the client's event loop.
#[derive(Debug)]
pub enum ConnEvent {
    Connected,
    Disconnected,
    Event(WireEvent),
    Presence(PresenceSnapshot),
    Pong { probe_id: String },
}

/// Cursor updates arrive on their own topic in a compact broadcast shape;
/// the reader lifts them into ordinary CURSOR_MOVED events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorBroadcast {
    user_id: Uuid,
    x: f64,
    y: f64,
    #[serde(default)]
    user_display_name: Option<String>,
    #[serde(default)]
    cursor_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PongBody {
    ping_id: String,
}

const EVENT_CHANNEL_CAPACITY: usize = 512;

pub struct Connection {
    transport: Arc<dyn FrameTransport>,
    url: String,
    tokens: Arc<dyn TokenProvider>,
    handshake_timeout: Duration,
    /// Serializes connect/disconnect so two callers cannot interleave a
    /// handshake with a teardown.
    lifecycle: Mutex<()>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    outgoing: StdRwLock<Option<mpsc::Sender<Frame>>>,
    current_diagram: StdRwLock<Option<Uuid>>,
    epoch: AtomicU64,
    reader: StdMutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::Sender<ConnEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<ConnEvent>>>,
}

impl Connection {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            url: url.into(),
            tokens,
            handshake_timeout,
            lifecycle: Mutex::new(()),
            state_tx: Arc::new(state_tx),
            outgoing: StdRwLock::new(None),
            current_diagram: StdRwLock::new(None),
            epoch: AtomicU64::new(0),
            reader: StdMutex::new(None),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        })
    }

    /// Take the inbound event stream. Yields once; the client owns it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ConnEvent>> {
        self.events_rx.lock().ok().and_then(|mut g| g.take())
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn current_diagram(&self) -> Option<Uuid> {
        self.current_diagram.read().ok().and_then(|g| *g)
    }

    pub fn has_token(&self) -> bool {
        self.tokens.token().is_some()
    }

    /// Open the transport, perform the handshake, and replay the session's
    /// subscriptions. Idempotent while connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CollabError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let token = self.tokens.token().ok_or(CollabError::AuthRequired)?;

        let _ = self.state_tx.send(ConnectionState::Connecting);
        let mut link = match self.transport.open(&self.url).await {
            Ok(link) => link,
            Err(e) => {
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = self.handshake(&mut link, &token).await {
            let _ = self.state_tx.send(ConnectionState::Disconnected);
            return Err(e);
        }

        // New generation; any reader from a previous link is now stale.
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(old) = guard.take() {
                old.abort();
            }
        }
        if let Ok(mut guard) = self.outgoing.write() {
            *guard = Some(link.outgoing.clone());
        }

        let setup = async {
            link.outgoing
                .send(Frame::subscribe(PERSONAL_QUEUE))
                .await
                .map_err(|_| CollabError::TransportClosed)?;
            link.outgoing
                .send(Frame::subscribe(PONG_QUEUE))
                .await
                .map_err(|_| CollabError::TransportClosed)?;
            if let Some(diagram_id) = self.current_diagram() {
                self.send_diagram_setup(&link.outgoing, diagram_id).await?;
            }
            Ok::<(), CollabError>(())
        };
        if let Err(e) = setup.await {
            self.mark_disconnected(epoch);
            return Err(e);
        }

        let _ = self.state_tx.send(ConnectionState::Connected);
        let _ = self.events_tx.try_send(ConnEvent::Connected);

        let weak = Arc::downgrade(self);
        let events_tx = self.events_tx.clone();
        let mut incoming = link.incoming;
        let handle = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                match frame.command {
                    FrameCommand::Message => route_frame(&frame, &events_tx).await,
                    FrameCommand::Error => {
                        log::warn!("server error frame: {}", frame.body);
                        break;
                    }
                    other => log::debug!("ignoring inbound {other:?} frame"),
                }
            }
            if let Some(conn) = weak.upgrade() {
                conn.mark_disconnected(epoch);
            }
        });
        if let Ok(mut guard) = self.reader.lock() {
            *guard = Some(handle);
        }
        log::info!("connected to {}", self.url);
        Ok(())
    }

    async fn handshake(
        &self,
        link: &mut crate::transport::FrameLink,
        token: &str,
    ) -> Result<(), CollabError> {
        link.outgoing
            .send(Frame::connect(token))
            .await
            .map_err(|_| CollabError::TransportClosed)?;
        let reply = tokio::time::timeout(self.handshake_timeout, link.incoming.recv())
            .await
            .map_err(|_| CollabError::Protocol("handshake timed out".into()))?
            .ok_or(CollabError::TransportClosed)?;
        match reply.command {
            FrameCommand::Connected => Ok(()),
            FrameCommand::Error => Err(CollabError::Protocol(reply.body)),
            other => Err(CollabError::Protocol(format!(
                "unexpected handshake reply {other:?}"
            ))),
        }
    }

    /// Tear the session down and stop surfacing events until the next
    /// `connect()`.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(old) = guard.take() {
                old.abort();
            }
        }
        self.mark_disconnected(epoch);
    }

    fn mark_disconnected(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return; // a newer link owns the state
        }
        let had_link = self
            .outgoing
            .write()
            .ok()
            .map(|mut g| g.take().is_some())
            .unwrap_or(false);
        let was_up = *self.state_tx.borrow() != ConnectionState::Disconnected;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        if had_link || was_up {
            let _ = self.events_tx.try_send(ConnEvent::Disconnected);
            log::info!("disconnected from {}", self.url);
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Frame>, CollabError> {
        self.outgoing
            .read()
            .ok()
            .and_then(|g| g.clone())
            .ok_or(CollabError::TransportClosed)
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), CollabError> {
        let sender = self.sender()?;
        sender
            .send(frame)
            .await
            .map_err(|_| CollabError::TransportClosed)
    }

    async fn send_diagram_setup(
        &self,
        outgoing: &mpsc::Sender<Frame>,
        diagram_id: Uuid,
    ) -> Result<(), CollabError> {
        for frame in [
            Frame::subscribe(events_topic(diagram_id)),
            Frame::subscribe(presence_topic(diagram_id)),
            Frame::subscribe(cursors_topic(diagram_id)),
            Frame::send(join_dest(diagram_id), ""),
        ] {
            outgoing
                .send(frame)
                .await
                .map_err(|_| CollabError::TransportClosed)?;
        }
        Ok(())
    }

    /// Switch to a diagram's channels. While disconnected this only
    /// records intent; the next `connect()` replays it.
    pub async fn join_diagram(&self, diagram_id: Uuid) -> Result<(), CollabError> {
        let previous = {
            let mut guard = self
                .current_diagram
                .write()
                .map_err(|_| CollabError::Protocol("diagram state poisoned".into()))?;
            if *guard == Some(diagram_id) {
                return Ok(());
            }
            guard.replace(diagram_id)
        };
        if !self.is_connected() {
            return Ok(());
        }
        let sender = self.sender()?;
        if let Some(old) = previous {
            self.send_diagram_teardown(&sender, old).await?;
        }
        self.send_diagram_setup(&sender, diagram_id).await
    }

    /// Leave the current diagram's channels, if any.
    pub async fn leave_diagram(&self) -> Result<(), CollabError> {
        let previous = {
            let mut guard = self
                .current_diagram
                .write()
                .map_err(|_| CollabError::Protocol("diagram state poisoned".into()))?;
            guard.take()
        };
        let Some(diagram_id) = previous else {
            return Ok(());
        };
        if !self.is_connected() {
            return Ok(());
        }
        let sender = self.sender()?;
        self.send_diagram_teardown(&sender, diagram_id).await
    }

    async fn send_diagram_teardown(
        &self,
        outgoing: &mpsc::Sender<Frame>,
        diagram_id: Uuid,
    ) -> Result<(), CollabError> {
        for frame in [
            Frame::send(leave_dest(diagram_id), ""),
            Frame::unsubscribe(events_topic(diagram_id)),
            Frame::unsubscribe(presence_topic(diagram_id)),
            Frame::unsubscribe(cursors_topic(diagram_id)),
        ] {
            outgoing
                .send(frame)
                .await
                .map_err(|_| CollabError::TransportClosed)?;
        }
        Ok(())
    }

    /// Publish a document event body to the current diagram. The body is
    /// `{type, payload}`; the server stamps the sender and timestamp.
    pub async fn send_diagram_event(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), CollabError> {
        let diagram_id = self
            .current_diagram()
            .ok_or_else(|| CollabError::Protocol("no diagram joined".into()))?;
        let body = serde_json::json!({ "type": kind, "payload": payload });
        self.send_frame(Frame::send(event_dest(diagram_id), body.to_string()))
            .await
    }

    /// Publish a raw body to a per-diagram destination.
    pub async fn publish(
        &self,
        destination: String,
        body: String,
    ) -> Result<(), CollabError> {
        self.send_frame(Frame::send(destination, body)).await
    }

    /// Fire a latency probe.
    pub async fn send_ping(&self, probe_id: &str) -> Result<(), CollabError> {
        let body = serde_json::json!({ "pingId": probe_id });
        self.send_frame(Frame::send(PING_DEST, body.to_string())).await
    }
}

async fn route_frame(frame: &Frame, events_tx: &mpsc::Sender<ConnEvent>) {
    let event = match frame.destination.as_str() {
        PONG_QUEUE => match serde_json::from_str::<PongBody>(&frame.body) {
            Ok(pong) => ConnEvent::Pong {
                probe_id: pong.ping_id,
            },
            Err(e) => {
                log::warn!("dropping malformed pong: {e}");
                return;
            }
        },
        PERSONAL_QUEUE => match WireEvent::decode(&frame.body) {
            Ok(event) => ConnEvent::Event(event),
            Err(e) => {
                log::warn!("dropping malformed direct message: {e}");
                return;
            }
        },
        dest => {
            let Some((diagram_id, channel)) = parse_diagram_topic(dest) else {
                log::debug!("message on unrecognized destination {dest}");
                return;
            };
            match channel {
                "events" => match WireEvent::decode(&frame.body) {
                    Ok(event) => ConnEvent::Event(event),
                    Err(e) => {
                        log::warn!("dropping malformed event: {e}");
                        return;
                    }
                },
                "presence" => match serde_json::from_str::<PresenceSnapshot>(&frame.body) {
                    Ok(snapshot) => ConnEvent::Presence(snapshot),
                    Err(e) => {
                        log::warn!("dropping malformed roster: {e}");
                        return;
                    }
                },
                "cursors" => match serde_json::from_str::<CursorBroadcast>(&frame.body) {
                    Ok(cursor) => {
                        let payload = serde_json::json!({
                            "x": cursor.x,
                            "y": cursor.y,
                            "userDisplayName": cursor.user_display_name,
                            "cursorColor": cursor.cursor_color,
                        });
                        ConnEvent::Event(WireEvent::new(
                            EventKind::CursorMoved,
                            diagram_id,
                            cursor.user_id,
                            payload,
                        ))
                    }
                    Err(e) => {
                        log::warn!("dropping malformed cursor broadcast: {e}");
                        return;
                    }
                },
                other => {
                    log::debug!("message on unrecognized channel {other}");
                    return;
                }
            }
        }
    };
    if events_tx.send(event).await.is_err() {
        log::debug!("event stream consumer gone");
    }
}
