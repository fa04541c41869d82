//! The [`Document`] container and its mutation API.
//!
//! Semantics that the synchronization engine depends on:
//!
//! - Updates and deletes addressing an unknown id are **no-ops**, not
//!   errors. A peer may have deleted the entity concurrently; applying the
//!   same delete twice must leave the document unchanged.
//! - Adding an entity whose id already exists replaces it (last writer
//!   wins).
//! - Every mutation that changes state emits exactly one [`DocumentEvent`]
//!   to all listeners, synchronously, before the mutation call returns.
//! - `HistoryOpts { record: false }` suppresses the undo-log entry but
//!   never the event.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::history::History;
use crate::schema::{
    Area, AreaChanges, Field, FieldChanges, Index, IndexChanges, Note, NoteChanges, Relationship,
    RelationshipChanges, Table, TableChanges,
};

/// Whether a mutation should be recorded in the local undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryOpts {
    pub record: bool,
}

impl HistoryOpts {
    /// Record the mutation (local user edit).
    pub fn record() -> Self {
        Self { record: true }
    }

    /// Apply without recording (remote-originated mutation).
    pub fn skip() -> Self {
        Self { record: false }
    }
}

impl Default for HistoryOpts {
    fn default() -> Self {
        Self::record()
    }
}

/// Errors from the mutation API.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// The provided entity is structurally invalid (e.g. nil id).
    InvalidEntity(String),
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEntity(reason) => write!(f, "invalid entity: {reason}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Typed notification emitted on every document mutation.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    TablesAdded { tables: Vec<Table> },
    TableUpdated { table_id: Uuid, changes: TableChanges },
    TablesRemoved { table_ids: Vec<Uuid> },
    FieldAdded { table_id: Uuid, field: Field },
    FieldUpdated { table_id: Uuid, field_id: Uuid, changes: FieldChanges },
    FieldRemoved { table_id: Uuid, field_id: Uuid },
    IndexAdded { table_id: Uuid, index: Index },
    IndexUpdated { table_id: Uuid, index_id: Uuid, changes: IndexChanges },
    IndexRemoved { table_id: Uuid, index_id: Uuid },
    RelationshipAdded { relationship: Relationship },
    RelationshipUpdated { relationship_id: Uuid, changes: RelationshipChanges },
    RelationshipRemoved { relationship_id: Uuid },
    AreaAdded { area: Area },
    AreaUpdated { area_id: Uuid, changes: AreaChanges },
    AreaRemoved { area_id: Uuid },
    NoteAdded { note: Note },
    NoteUpdated { note_id: Uuid, changes: NoteChanges },
    NoteRemoved { note_id: Uuid },
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type EventListener = Arc<dyn Fn(&DocumentEvent) + Send + Sync>;

/// Serializable snapshot of the full document state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot<'a> {
    pub tables: &'a [Table],
    pub relationships: &'a [Relationship],
    pub areas: &'a [Area],
    pub notes: &'a [Note],
}

/// One schema diagram's full state.
pub struct Document {
    tables: Vec<Table>,
    relationships: Vec<Relationship>,
    areas: Vec<Area>,
    notes: Vec<Note>,
    history: History,
    listeners: Vec<(u64, EventListener)>,
    next_listener_id: u64,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("tables", &self.tables.len())
            .field("relationships", &self.relationships.len())
            .field("areas", &self.areas.len())
            .field("notes", &self.notes.len())
            .field("history", &self.history.len())
            .finish()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            relationships: Vec::new(),
            areas: Vec::new(),
            notes: Vec::new(),
            history: History::default(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    // ── listeners ────────────────────────────────────────────────

    /// Register a listener invoked synchronously on every mutation.
    pub fn on_event(
        &mut self,
        listener: impl Fn(&DocumentEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.next_listener_id += 1;
        let id = self.next_listener_id;
        self.listeners.push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id.0);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: DocumentEvent, opts: HistoryOpts) {
        for (_, listener) in &self.listeners {
            listener(&event);
        }
        if opts.record {
            self.history.push(event);
        }
    }

    // ── accessors ────────────────────────────────────────────────

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, id: Uuid) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn relationship(&self, id: Uuid) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.id == id)
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn area(&self, id: Uuid) -> Option<&Area> {
        self.areas.iter().find(|a| a.id == id)
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn note(&self, id: Uuid) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> DocumentSnapshot<'_> {
        DocumentSnapshot {
            tables: &self.tables,
            relationships: &self.relationships,
            areas: &self.areas,
            notes: &self.notes,
        }
    }

    // ── tables ───────────────────────────────────────────────────

    pub fn add_tables(&mut self, tables: Vec<Table>, opts: HistoryOpts) -> Result<(), DocumentError> {
        if tables.iter().any(|t| t.id.is_nil()) {
            return Err(DocumentError::InvalidEntity("table id is nil".into()));
        }
        for table in &tables {
            // Replace on id collision (last writer wins).
            self.tables.retain(|t| t.id != table.id);
            self.tables.push(table.clone());
        }
        if !tables.is_empty() {
            self.emit(DocumentEvent::TablesAdded { tables }, opts);
        }
        Ok(())
    }

    pub fn update_table(
        &mut self,
        table_id: Uuid,
        changes: TableChanges,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(table) = self.tables.iter_mut().find(|t| t.id == table_id) else {
            log::debug!("update_table: unknown table {table_id}, ignoring");
            return Ok(());
        };
        changes.apply(table);
        self.emit(DocumentEvent::TableUpdated { table_id, changes }, opts);
        Ok(())
    }

    pub fn remove_tables(
        &mut self,
        table_ids: Vec<Uuid>,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let removed: Vec<Uuid> = table_ids
            .iter()
            .copied()
            .filter(|id| self.tables.iter().any(|t| t.id == *id))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        self.tables.retain(|t| !removed.contains(&t.id));
        // Relationships referencing a removed table go with it.
        self.relationships
            .retain(|r| !removed.contains(&r.source_table_id) && !removed.contains(&r.target_table_id));
        self.emit(DocumentEvent::TablesRemoved { table_ids: removed }, opts);
        Ok(())
    }

    // ── fields ───────────────────────────────────────────────────

    pub fn add_field(
        &mut self,
        table_id: Uuid,
        field: Field,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        if field.id.is_nil() {
            return Err(DocumentError::InvalidEntity("field id is nil".into()));
        }
        let Some(table) = self.tables.iter_mut().find(|t| t.id == table_id) else {
            log::debug!("add_field: unknown table {table_id}, ignoring");
            return Ok(());
        };
        table.fields.retain(|f| f.id != field.id);
        table.fields.push(field.clone());
        self.emit(DocumentEvent::FieldAdded { table_id, field }, opts);
        Ok(())
    }

    pub fn update_field(
        &mut self,
        table_id: Uuid,
        field_id: Uuid,
        changes: FieldChanges,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(field) = self
            .tables
            .iter_mut()
            .find(|t| t.id == table_id)
            .and_then(|t| t.fields.iter_mut().find(|f| f.id == field_id))
        else {
            log::debug!("update_field: unknown field {field_id} on table {table_id}, ignoring");
            return Ok(());
        };
        changes.apply(field);
        self.emit(
            DocumentEvent::FieldUpdated { table_id, field_id, changes },
            opts,
        );
        Ok(())
    }

    pub fn remove_field(
        &mut self,
        table_id: Uuid,
        field_id: Uuid,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(table) = self.tables.iter_mut().find(|t| t.id == table_id) else {
            return Ok(());
        };
        let before = table.fields.len();
        table.fields.retain(|f| f.id != field_id);
        if table.fields.len() == before {
            return Ok(());
        }
        self.emit(DocumentEvent::FieldRemoved { table_id, field_id }, opts);
        Ok(())
    }

    // ── indexes ──────────────────────────────────────────────────

    pub fn add_index(
        &mut self,
        table_id: Uuid,
        index: Index,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        if index.id.is_nil() {
            return Err(DocumentError::InvalidEntity("index id is nil".into()));
        }
        let Some(table) = self.tables.iter_mut().find(|t| t.id == table_id) else {
            log::debug!("add_index: unknown table {table_id}, ignoring");
            return Ok(());
        };
        table.indexes.retain(|i| i.id != index.id);
        table.indexes.push(index.clone());
        self.emit(DocumentEvent::IndexAdded { table_id, index }, opts);
        Ok(())
    }

    pub fn update_index(
        &mut self,
        table_id: Uuid,
        index_id: Uuid,
        changes: IndexChanges,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(index) = self
            .tables
            .iter_mut()
            .find(|t| t.id == table_id)
            .and_then(|t| t.indexes.iter_mut().find(|i| i.id == index_id))
        else {
            return Ok(());
        };
        changes.apply(index);
        self.emit(
            DocumentEvent::IndexUpdated { table_id, index_id, changes },
            opts,
        );
        Ok(())
    }

    pub fn remove_index(
        &mut self,
        table_id: Uuid,
        index_id: Uuid,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(table) = self.tables.iter_mut().find(|t| t.id == table_id) else {
            return Ok(());
        };
        let before = table.indexes.len();
        table.indexes.retain(|i| i.id != index_id);
        if table.indexes.len() == before {
            return Ok(());
        }
        self.emit(DocumentEvent::IndexRemoved { table_id, index_id }, opts);
        Ok(())
    }

    // ── relationships ────────────────────────────────────────────

    pub fn add_relationship(
        &mut self,
        relationship: Relationship,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        if relationship.id.is_nil() {
            return Err(DocumentError::InvalidEntity("relationship id is nil".into()));
        }
        self.relationships.retain(|r| r.id != relationship.id);
        self.relationships.push(relationship.clone());
        self.emit(DocumentEvent::RelationshipAdded { relationship }, opts);
        Ok(())
    }

    pub fn update_relationship(
        &mut self,
        relationship_id: Uuid,
        changes: RelationshipChanges,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(relationship) = self.relationships.iter_mut().find(|r| r.id == relationship_id)
        else {
            log::debug!("update_relationship: unknown relationship {relationship_id}, ignoring");
            return Ok(());
        };
        changes.apply(relationship);
        self.emit(
            DocumentEvent::RelationshipUpdated { relationship_id, changes },
            opts,
        );
        Ok(())
    }

    pub fn remove_relationship(
        &mut self,
        relationship_id: Uuid,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let before = self.relationships.len();
        self.relationships.retain(|r| r.id != relationship_id);
        if self.relationships.len() == before {
            return Ok(());
        }
        self.emit(DocumentEvent::RelationshipRemoved { relationship_id }, opts);
        Ok(())
    }

    // ── areas ────────────────────────────────────────────────────

    pub fn add_area(&mut self, area: Area, opts: HistoryOpts) -> Result<(), DocumentError> {
        if area.id.is_nil() {
            return Err(DocumentError::InvalidEntity("area id is nil".into()));
        }
        self.areas.retain(|a| a.id != area.id);
        self.areas.push(area.clone());
        self.emit(DocumentEvent::AreaAdded { area }, opts);
        Ok(())
    }

    pub fn update_area(
        &mut self,
        area_id: Uuid,
        changes: AreaChanges,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(area) = self.areas.iter_mut().find(|a| a.id == area_id) else {
            return Ok(());
        };
        changes.apply(area);
        self.emit(DocumentEvent::AreaUpdated { area_id, changes }, opts);
        Ok(())
    }

    pub fn remove_area(&mut self, area_id: Uuid, opts: HistoryOpts) -> Result<(), DocumentError> {
        let before = self.areas.len();
        self.areas.retain(|a| a.id != area_id);
        if self.areas.len() == before {
            return Ok(());
        }
        self.emit(DocumentEvent::AreaRemoved { area_id }, opts);
        Ok(())
    }

    // ── notes ────────────────────────────────────────────────────

    pub fn add_note(&mut self, note: Note, opts: HistoryOpts) -> Result<(), DocumentError> {
        if note.id.is_nil() {
            return Err(DocumentError::InvalidEntity("note id is nil".into()));
        }
        self.notes.retain(|n| n.id != note.id);
        self.notes.push(note.clone());
        self.emit(DocumentEvent::NoteAdded { note }, opts);
        Ok(())
    }

    pub fn update_note(
        &mut self,
        note_id: Uuid,
        changes: NoteChanges,
        opts: HistoryOpts,
    ) -> Result<(), DocumentError> {
        let Some(note) = self.notes.iter_mut().find(|n| n.id == note_id) else {
            return Ok(());
        };
        changes.apply(note);
        self.emit(DocumentEvent::NoteUpdated { note_id, changes }, opts);
        Ok(())
    }

    pub fn remove_note(&mut self, note_id: Uuid, opts: HistoryOpts) -> Result<(), DocumentError> {
        let before = self.notes.len();
        self.notes.retain(|n| n.id != note_id);
        if self.notes.len() == before {
            return Ok(());
        }
        self.emit(DocumentEvent::NoteRemoved { note_id }, opts);
        Ok(())
    }
}
