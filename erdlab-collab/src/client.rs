//! The collaboration client: one object per editing session.
//!
//! Wires the connection, sync translator, presence aggregator, latency
//! prober, and event router together and drives them from two tasks:
//!
//! - the event loop drains [`ConnEvent`]s, feeding presence events to
//!   the aggregator, document events to the translator's apply queue,
//!   pongs to the prober, and every wire event to the router;
//! - the health loop watches the session. While the client is active it
//!   reconnects a dropped link (the connection replays the diagram's
//!   subscriptions) and tears the session down if the credential
//!   disappears.
//!
//! Consumers read state through `watch` channels and mutate the shared
//! [`Document`] directly; publishing happens as a side effect of the
//! mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use erdlab_core::Document;

use crate::connection::{
    cursor_dest, lock_dest, selection_dest, unlock_dest, ConnEvent, Connection, ConnectionState,
    TokenProvider,
};
use crate::event::{CollabError, WireEvent};
use crate::latency::LatencyProber;
use crate::presence::{PresenceAggregator, UserPresence};
use crate::router::{EventFilter, EventRouter, ListenerId};
use crate::sync::SyncTranslator;
use crate::transport::{FrameTransport, WsTransport};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub handshake_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// Identity the session acts as.
#[derive(Debug, Clone)]
pub struct LocalUser {
    pub id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl LocalUser {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            email: None,
            name: None,
        }
    }
}

pub struct CollabClient {
    connection: Arc<Connection>,
    document: Arc<RwLock<Document>>,
    translator: Arc<SyncTranslator>,
    presence: Arc<StdMutex<PresenceAggregator>>,
    prober: Arc<LatencyProber>,
    router: Arc<StdMutex<EventRouter>>,
    user: LocalUser,
    active: Arc<AtomicBool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl CollabClient {
    /// Connect over WebSocket with a fresh document.
    pub async fn open(
        config: ClientConfig,
        user: LocalUser,
        tokens: Arc<dyn TokenProvider>,
    ) -> Arc<Self> {
        Self::with_transport(
            config,
            user,
            tokens,
            Arc::new(WsTransport),
            Arc::new(RwLock::new(Document::new())),
        )
        .await
    }

    /// Full construction with an explicit transport and document.
    pub async fn with_transport(
        config: ClientConfig,
        user: LocalUser,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn FrameTransport>,
        document: Arc<RwLock<Document>>,
    ) -> Arc<Self> {
        let connection = Connection::new(
            transport,
            config.server_url.clone(),
            tokens,
            config.handshake_timeout,
        );
        let translator =
            SyncTranslator::start(connection.clone(), document.clone(), user.id).await;
        let presence = Arc::new(StdMutex::new(PresenceAggregator::new(user.id)));
        let prober = Arc::new(LatencyProber::new(
            connection.clone(),
            config.probe_interval,
            config.probe_timeout,
        ));
        let router = Arc::new(StdMutex::new(EventRouter::new()));
        let active = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();

        // event loop
        if let Some(mut events) = connection.take_events() {
            let translator = translator.clone();
            let presence = presence.clone();
            let prober = prober.clone();
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(conn_event) = events.recv().await {
                    match conn_event {
                        ConnEvent::Connected => prober.start(),
                        ConnEvent::Disconnected => prober.stop(),
                        ConnEvent::Pong { probe_id } => prober.handle_pong(&probe_id),
                        ConnEvent::Presence(snapshot) => {
                            if let Ok(mut presence) = presence.lock() {
                                presence.apply_snapshot(snapshot);
                            }
                        }
                        ConnEvent::Event(event) => {
                            if event.kind.is_presence() {
                                if let Ok(mut presence) = presence.lock() {
                                    presence.apply_event(&event);
                                }
                            } else {
                                translator.enqueue_remote(event.clone()).await;
                            }
                            if let Ok(router) = router.lock() {
                                router.dispatch(&event);
                            }
                        }
                    }
                }
            }));
        }

        // health loop
        {
            let connection = connection.clone();
            let active = active.clone();
            let interval = config.health_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !active.load(Ordering::SeqCst) {
                        continue;
                    }
                    if !connection.has_token() {
                        if connection.is_connected() {
                            log::warn!("credential lost, dropping session");
                            connection.disconnect().await;
                        }
                        continue;
                    }
                    if connection.state() == ConnectionState::Disconnected {
                        log::info!("session down, reconnecting");
                        if let Err(e) = connection.connect().await {
                            log::warn!("reconnect failed: {e}");
                        }
                    }
                }
            }));
        }

        Arc::new(Self {
            connection,
            document,
            translator,
            presence,
            prober,
            router,
            user,
            active,
            tasks: StdMutex::new(tasks),
        })
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    /// The shared document. Mutations made through its API while a
    /// diagram is joined are published automatically.
    pub fn document(&self) -> Arc<RwLock<Document>> {
        self.document.clone()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn watch_presence(&self) -> watch::Receiver<Vec<UserPresence>> {
        self.presence
            .lock()
            .map(|p| p.watch_roster())
            .unwrap_or_else(|_| watch::channel(Vec::new()).1)
    }

    pub fn watch_latency(&self) -> watch::Receiver<Option<Duration>> {
        self.prober.watch_latency()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn current_diagram(&self) -> Option<Uuid> {
        self.connection.current_diagram()
    }

    /// Establish the session without joining a diagram.
    pub async fn connect(&self) -> Result<(), CollabError> {
        self.active.store(true, Ordering::SeqCst);
        self.connection.connect().await
    }

    /// Join a diagram's channels, connecting on demand.
    pub async fn join_diagram(&self, diagram_id: Uuid) -> Result<(), CollabError> {
        self.active.store(true, Ordering::SeqCst);
        if let Ok(mut presence) = self.presence.lock() {
            presence.set_joined(diagram_id);
        }
        self.connection.join_diagram(diagram_id).await?;
        if !self.connection.is_connected() {
            self.connection.connect().await?;
        }
        Ok(())
    }

    /// Leave the current diagram. The session stays up.
    pub async fn leave_diagram(&self) -> Result<(), CollabError> {
        if let Ok(mut presence) = self.presence.lock() {
            presence.leave();
        }
        self.connection.leave_diagram().await
    }

    // ── presence publishing (fire-and-forget) ────────────────────
    //
    // These skip silently when no session or diagram is up; cursor and
    // selection traffic is ephemeral and not worth queueing.

    pub async fn send_cursor_position(&self, x: f64, y: f64) -> Result<(), CollabError> {
        let Some(diagram_id) = self.publish_target() else {
            return Ok(());
        };
        let body = serde_json::json!({
            "userId": self.user.id,
            "x": x,
            "y": y,
            "userDisplayName": self.user.name,
        });
        self.connection
            .publish(cursor_dest(diagram_id), body.to_string())
            .await
    }

    pub async fn send_selection_change(
        &self,
        element_id: Option<Uuid>,
    ) -> Result<(), CollabError> {
        let Some(diagram_id) = self.publish_target() else {
            return Ok(());
        };
        let body = serde_json::json!({
            "userId": self.user.id,
            "elementId": element_id,
        });
        self.connection
            .publish(selection_dest(diagram_id), body.to_string())
            .await
    }

    pub async fn lock_element(
        &self,
        element_type: &str,
        element_id: Uuid,
    ) -> Result<(), CollabError> {
        let Some(diagram_id) = self.publish_target() else {
            return Ok(());
        };
        let body = serde_json::json!({
            "userId": self.user.id,
            "elementType": element_type,
            "elementId": element_id,
        });
        self.connection
            .publish(lock_dest(diagram_id), body.to_string())
            .await
    }

    pub async fn unlock_element(
        &self,
        element_type: &str,
        element_id: Uuid,
    ) -> Result<(), CollabError> {
        let Some(diagram_id) = self.publish_target() else {
            return Ok(());
        };
        let body = serde_json::json!({
            "userId": self.user.id,
            "elementType": element_type,
            "elementId": element_id,
        });
        self.connection
            .publish(unlock_dest(diagram_id), body.to_string())
            .await
    }

    fn publish_target(&self) -> Option<Uuid> {
        if !self.connection.is_connected() {
            return None;
        }
        self.connection.current_diagram()
    }

    // ── event listeners ──────────────────────────────────────────

    pub fn subscribe<F>(&self, filter: EventFilter, listener: F) -> Option<ListenerId>
    where
        F: Fn(&WireEvent) + Send + Sync + 'static,
    {
        self.router
            .lock()
            .ok()
            .map(|mut r| r.add_listener(filter, listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.router
            .lock()
            .map(|mut r| r.remove_listener(id))
            .unwrap_or(false)
    }

    /// Stop everything: translator, prober, connection, and both loops.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.translator.stop().await;
        self.prober.stop();
        self.connection.disconnect().await;
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
