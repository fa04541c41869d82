//! Bidirectional translation between document mutations and wire events.
//!
//! Outbound: a synchronous document listener turns every local mutation
//! into `{type, payload}` bodies and hands them to a publisher task. The
//! listener checks three conditions inline, while the mutation's write
//! lock is still held: the echo guard is clear, a diagram is joined, and
//! the connection is up. Failing any of them skips publishing silently.
//!
//! Inbound: remote events are queued into a single FIFO apply worker.
//! The worker takes the document write lock, raises the echo guard,
//! applies the mutation with history recording suppressed, and lowers
//! the guard before releasing the lock. Because the outbound listener
//! runs synchronously under that same lock, a remote apply can never be
//! observed with the guard down, so nothing a peer sent is ever echoed
//! back.
//!
//! Self-echoes (events stamped with the local user's id, reflected by
//! the events topic) are discarded before they reach the apply queue.
//! A malformed payload drops that one event with a warning; the worker
//! and the session stay up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use erdlab_core::{Document, DocumentEvent, HistoryOpts, ListenerId};

use crate::connection::Connection;
use crate::event::{
    AreaCreatedPayload, AreaDeletedPayload, AreaUpdatedPayload, CollabError, ColumnCreatedPayload,
    ColumnDeletedPayload, ColumnUpdatedPayload, EventKind, IndexCreatedPayload,
    IndexDeletedPayload, IndexUpdatedPayload, NoteCreatedPayload, NoteDeletedPayload,
    NoteUpdatedPayload, RelationshipCreatedPayload, RelationshipDeletedPayload,
    RelationshipUpdatedPayload, TableCreatedPayload, TableDeletedPayload, TableUpdatedPayload,
    WireEvent,
};

const QUEUE_CAPACITY: usize = 256;

/// Raises the echo guard for the duration of one remote apply. Dropping
/// the flag lowers the guard on every exit path, including panics.
struct EchoFlag<'a> {
    flag: &'a AtomicBool,
}

impl<'a> EchoFlag<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for EchoFlag<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct SyncTranslator {
    document: Arc<RwLock<Document>>,
    local_user_id: Uuid,
    apply_tx: mpsc::Sender<WireEvent>,
    listener: ListenerId,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncTranslator {
    /// Wire a document to a connection. Registers the outbound listener
    /// and spawns the publisher and apply-worker tasks.
    pub async fn start(
        connection: Arc<Connection>,
        document: Arc<RwLock<Document>>,
        local_user_id: Uuid,
    ) -> Arc<Self> {
        let echo_guard = Arc::new(AtomicBool::new(false));
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<(EventKind, serde_json::Value)>(QUEUE_CAPACITY);
        let (apply_tx, mut apply_rx) = mpsc::channel::<WireEvent>(QUEUE_CAPACITY);

        let listener = {
            let guard = echo_guard.clone();
            let conn = connection.clone();
            document.write().await.on_event(move |event| {
                if guard.load(Ordering::SeqCst) {
                    return; // remote apply in progress
                }
                if conn.current_diagram().is_none() || !conn.is_connected() {
                    return;
                }
                for (kind, payload) in translate_outbound(event) {
                    if outbound_tx.try_send((kind, payload)).is_err() {
                        log::warn!("outbound queue full, dropping {kind}");
                    }
                }
            })
        };

        let publisher = {
            let conn = connection.clone();
            tokio::spawn(async move {
                while let Some((kind, payload)) = outbound_rx.recv().await {
                    if let Err(e) = conn.send_diagram_event(kind, payload).await {
                        log::warn!("failed to publish {kind}: {e}");
                    }
                }
            })
        };

        let worker = {
            let document = document.clone();
            let guard = echo_guard;
            tokio::spawn(async move {
                while let Some(event) = apply_rx.recv().await {
                    let mut doc = document.write().await;
                    let flag = EchoFlag::engage(&guard);
                    if let Err(e) = apply_remote(&mut doc, &event) {
                        log::warn!("dropping {} from {}: {e}", event.kind, event.user_id);
                    }
                    drop(flag);
                }
            })
        };

        Arc::new(Self {
            document,
            local_user_id,
            apply_tx,
            listener,
            tasks: StdMutex::new(vec![publisher, worker]),
        })
    }

    /// Queue a remote document event for application. Self-echoes and
    /// non-document kinds are discarded here.
    pub async fn enqueue_remote(&self, event: WireEvent) {
        if event.user_id == self.local_user_id {
            log::trace!("discarding self-echo {}", event.kind);
            return;
        }
        if !event.kind.is_document() {
            return;
        }
        if event.kind == EventKind::DiagramUpdated {
            log::info!("diagram metadata updated by {}", event.user_id);
            return;
        }
        if self.apply_tx.send(event).await.is_err() {
            log::warn!("apply worker gone, dropping remote event");
        }
    }

    /// Detach from the document and stop both tasks. Queued work is
    /// abandoned.
    pub async fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.document.write().await.remove_listener(self.listener);
    }
}

impl Drop for SyncTranslator {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn payload_of<T: Serialize>(kind: EventKind, payload: &T) -> Option<(EventKind, serde_json::Value)> {
    match serde_json::to_value(payload) {
        Ok(value) => Some((kind, value)),
        Err(e) => {
            log::error!("failed to encode {kind} payload: {e}");
            None
        }
    }
}

/// Map one document mutation to its wire events. Batch mutations fan
/// out to one event per entity.
fn translate_outbound(event: &DocumentEvent) -> Vec<(EventKind, serde_json::Value)> {
    match event {
        DocumentEvent::TablesAdded { tables } => tables
            .iter()
            .filter_map(|table| {
                payload_of(
                    EventKind::TableCreated,
                    &TableCreatedPayload { table: table.clone() },
                )
            })
            .collect(),
        DocumentEvent::TableUpdated { table_id, changes } => payload_of(
            EventKind::TableUpdated,
            &TableUpdatedPayload { table_id: *table_id, changes: changes.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::TablesRemoved { table_ids } => table_ids
            .iter()
            .filter_map(|table_id| {
                payload_of(
                    EventKind::TableDeleted,
                    &TableDeletedPayload { table_id: *table_id },
                )
            })
            .collect(),
        DocumentEvent::FieldAdded { table_id, field } => payload_of(
            EventKind::ColumnCreated,
            &ColumnCreatedPayload { table_id: *table_id, field: field.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::FieldUpdated { table_id, field_id, changes } => payload_of(
            EventKind::ColumnUpdated,
            &ColumnUpdatedPayload {
                table_id: *table_id,
                field_id: *field_id,
                field: changes.clone(),
            },
        )
        .into_iter()
        .collect(),
        DocumentEvent::FieldRemoved { table_id, field_id } => payload_of(
            EventKind::ColumnDeleted,
            &ColumnDeletedPayload { table_id: *table_id, field_id: *field_id },
        )
        .into_iter()
        .collect(),
        DocumentEvent::IndexAdded { table_id, index } => payload_of(
            EventKind::IndexCreated,
            &IndexCreatedPayload { table_id: *table_id, index: index.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::IndexUpdated { table_id, index_id, changes } => payload_of(
            EventKind::IndexUpdated,
            &IndexUpdatedPayload {
                table_id: *table_id,
                index_id: *index_id,
                index: changes.clone(),
            },
        )
        .into_iter()
        .collect(),
        DocumentEvent::IndexRemoved { table_id, index_id } => payload_of(
            EventKind::IndexDeleted,
            &IndexDeletedPayload { table_id: *table_id, index_id: *index_id },
        )
        .into_iter()
        .collect(),
        DocumentEvent::RelationshipAdded { relationship } => payload_of(
            EventKind::RelationshipCreated,
            &RelationshipCreatedPayload { relationship: relationship.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::RelationshipUpdated { relationship_id, changes } => payload_of(
            EventKind::RelationshipUpdated,
            &RelationshipUpdatedPayload {
                relationship_id: *relationship_id,
                changes: changes.clone(),
            },
        )
        .into_iter()
        .collect(),
        DocumentEvent::RelationshipRemoved { relationship_id } => payload_of(
            EventKind::RelationshipDeleted,
            &RelationshipDeletedPayload { relationship_id: *relationship_id },
        )
        .into_iter()
        .collect(),
        DocumentEvent::AreaAdded { area } => payload_of(
            EventKind::AreaCreated,
            &AreaCreatedPayload { area: area.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::AreaUpdated { area_id, changes } => payload_of(
            EventKind::AreaUpdated,
            &AreaUpdatedPayload { area_id: *area_id, changes: changes.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::AreaRemoved { area_id } => payload_of(
            EventKind::AreaDeleted,
            &AreaDeletedPayload { area_id: *area_id },
        )
        .into_iter()
        .collect(),
        DocumentEvent::NoteAdded { note } => payload_of(
            EventKind::NoteCreated,
            &NoteCreatedPayload { note: note.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::NoteUpdated { note_id, changes } => payload_of(
            EventKind::NoteUpdated,
            &NoteUpdatedPayload { note_id: *note_id, changes: changes.clone() },
        )
        .into_iter()
        .collect(),
        DocumentEvent::NoteRemoved { note_id } => payload_of(
            EventKind::NoteDeleted,
            &NoteDeletedPayload { note_id: *note_id },
        )
        .into_iter()
        .collect(),
    }
}

/// Apply one remote event to the document with history suppressed.
fn apply_remote(doc: &mut Document, event: &WireEvent) -> Result<(), CollabError> {
    let opts = HistoryOpts::skip();
    let invalid = |e: erdlab_core::DocumentError| CollabError::Malformed(e.to_string());
    match event.kind {
        EventKind::TableCreated => {
            let p: TableCreatedPayload = event.payload_as()?;
            doc.add_tables(vec![p.table], opts).map_err(invalid)
        }
        EventKind::TableUpdated => {
            let p: TableUpdatedPayload = event.payload_as()?;
            doc.update_table(p.table_id, p.changes, opts).map_err(invalid)
        }
        EventKind::TableDeleted => {
            let p: TableDeletedPayload = event.payload_as()?;
            doc.remove_tables(vec![p.table_id], opts).map_err(invalid)
        }
        EventKind::ColumnCreated => {
            let p: ColumnCreatedPayload = event.payload_as()?;
            doc.add_field(p.table_id, p.field, opts).map_err(invalid)
        }
        EventKind::ColumnUpdated => {
            let p: ColumnUpdatedPayload = event.payload_as()?;
            doc.update_field(p.table_id, p.field_id, p.field, opts).map_err(invalid)
        }
        EventKind::ColumnDeleted => {
            let p: ColumnDeletedPayload = event.payload_as()?;
            doc.remove_field(p.table_id, p.field_id, opts).map_err(invalid)
        }
        EventKind::IndexCreated => {
            let p: IndexCreatedPayload = event.payload_as()?;
            doc.add_index(p.table_id, p.index, opts).map_err(invalid)
        }
        EventKind::IndexUpdated => {
            let p: IndexUpdatedPayload = event.payload_as()?;
            doc.update_index(p.table_id, p.index_id, p.index, opts).map_err(invalid)
        }
        EventKind::IndexDeleted => {
            let p: IndexDeletedPayload = event.payload_as()?;
            doc.remove_index(p.table_id, p.index_id, opts).map_err(invalid)
        }
        EventKind::RelationshipCreated => {
            let p: RelationshipCreatedPayload = event.payload_as()?;
            doc.add_relationship(p.relationship, opts).map_err(invalid)
        }
        EventKind::RelationshipUpdated => {
            let p: RelationshipUpdatedPayload = event.payload_as()?;
            doc.update_relationship(p.relationship_id, p.changes, opts).map_err(invalid)
        }
        EventKind::RelationshipDeleted => {
            let p: RelationshipDeletedPayload = event.payload_as()?;
            doc.remove_relationship(p.relationship_id, opts).map_err(invalid)
        }
        EventKind::AreaCreated => {
            let p: AreaCreatedPayload = event.payload_as()?;
            doc.add_area(p.area, opts).map_err(invalid)
        }
        EventKind::AreaUpdated => {
            let p: AreaUpdatedPayload = event.payload_as()?;
            doc.update_area(p.area_id, p.changes, opts).map_err(invalid)
        }
        EventKind::AreaDeleted => {
            let p: AreaDeletedPayload = event.payload_as()?;
            doc.remove_area(p.area_id, opts).map_err(invalid)
        }
        EventKind::NoteCreated => {
            let p: NoteCreatedPayload = event.payload_as()?;
            doc.add_note(p.note, opts).map_err(invalid)
        }
        EventKind::NoteUpdated => {
            let p: NoteUpdatedPayload = event.payload_as()?;
            doc.update_note(p.note_id, p.changes, opts).map_err(invalid)
        }
        EventKind::NoteDeleted => {
            let p: NoteDeletedPayload = event.payload_as()?;
            doc.remove_note(p.note_id, opts).map_err(invalid)
        }
        kind => Err(CollabError::Protocol(format!(
            "{kind} is not a document mutation"
        ))),
    }
}
