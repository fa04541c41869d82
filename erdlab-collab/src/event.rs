//! Wire events exchanged with the collaboration server.
//!
//! The JSON shape is part of the server contract and must not drift:
//!
//! ```text
//! {
//!   "type": "TABLE_CREATED",
//!   "diagramId": "…",
//!   "userId": "…",
//!   "userEmail": "alice@example.com",
//!   "payload": { … },
//!   "timestamp": "2026-08-23T10:15:00Z"
//! }
//! ```
//!
//! [`EventKind`] is a closed enumeration; its `SCREAMING_SNAKE_CASE`
//! strings are the on-wire values. Payloads are typed per kind — decoding
//! treats every required field as jointly mandatory, so a payload missing
//! any of them fails as [`CollabError::Malformed`] and the whole event is
//! dropped by the caller.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use erdlab_core::{
    Area, AreaChanges, Field, FieldChanges, Index, IndexChanges, Note, NoteChanges, Relationship,
    RelationshipChanges, Table, TableChanges,
};

/// Errors surfaced by the collaboration engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    /// No credential available; `connect()` cannot proceed.
    AuthRequired,
    /// The server rejected the handshake or sent an invalid frame.
    Protocol(String),
    /// The transport closed underneath an operation.
    TransportClosed,
    /// An inbound event or frame failed to decode.
    Malformed(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRequired => write!(f, "not authenticated"),
            Self::Protocol(reason) => write!(f, "protocol error: {reason}"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::Malformed(reason) => write!(f, "malformed event: {reason}"),
        }
    }
}

impl std::error::Error for CollabError {}

/// Closed enumeration of wire event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TableCreated,
    TableUpdated,
    TableDeleted,
    ColumnCreated,
    ColumnUpdated,
    ColumnDeleted,
    IndexCreated,
    IndexUpdated,
    IndexDeleted,
    RelationshipCreated,
    RelationshipUpdated,
    RelationshipDeleted,
    AreaCreated,
    AreaUpdated,
    AreaDeleted,
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    DiagramUpdated,
    UserJoined,
    UserLeft,
    CursorMoved,
    SelectionChanged,
    ElementLocked,
    ElementUnlocked,
}

impl EventKind {
    /// The on-wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableCreated => "TABLE_CREATED",
            Self::TableUpdated => "TABLE_UPDATED",
            Self::TableDeleted => "TABLE_DELETED",
            Self::ColumnCreated => "COLUMN_CREATED",
            Self::ColumnUpdated => "COLUMN_UPDATED",
            Self::ColumnDeleted => "COLUMN_DELETED",
            Self::IndexCreated => "INDEX_CREATED",
            Self::IndexUpdated => "INDEX_UPDATED",
            Self::IndexDeleted => "INDEX_DELETED",
            Self::RelationshipCreated => "RELATIONSHIP_CREATED",
            Self::RelationshipUpdated => "RELATIONSHIP_UPDATED",
            Self::RelationshipDeleted => "RELATIONSHIP_DELETED",
            Self::AreaCreated => "AREA_CREATED",
            Self::AreaUpdated => "AREA_UPDATED",
            Self::AreaDeleted => "AREA_DELETED",
            Self::NoteCreated => "NOTE_CREATED",
            Self::NoteUpdated => "NOTE_UPDATED",
            Self::NoteDeleted => "NOTE_DELETED",
            Self::DiagramUpdated => "DIAGRAM_UPDATED",
            Self::UserJoined => "USER_JOINED",
            Self::UserLeft => "USER_LEFT",
            Self::CursorMoved => "CURSOR_MOVED",
            Self::SelectionChanged => "SELECTION_CHANGED",
            Self::ElementLocked => "ELEMENT_LOCKED",
            Self::ElementUnlocked => "ELEMENT_UNLOCKED",
        }
    }

    /// Presence-family kinds are consumed by the presence aggregator,
    /// never by the sync translator.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Self::UserJoined
                | Self::UserLeft
                | Self::CursorMoved
                | Self::SelectionChanged
                | Self::ElementLocked
                | Self::ElementUnlocked
        )
    }

    /// Document-family kinds carry schema mutations.
    pub fn is_document(&self) -> bool {
        !self.is_presence()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete, typed change notification exchanged between client and
/// server. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub diagram_id: Uuid,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WireEvent {
    pub fn new(kind: EventKind, diagram_id: Uuid, user_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind,
            diagram_id,
            user_id,
            user_email: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, CollabError> {
        serde_json::to_string(self).map_err(|e| CollabError::Malformed(e.to_string()))
    }

    pub fn decode(body: &str) -> Result<Self, CollabError> {
        serde_json::from_str(body).map_err(|e| CollabError::Malformed(e.to_string()))
    }

    /// Decode the payload into its typed shape for this kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CollabError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CollabError::Malformed(format!("{} payload: {e}", self.kind)))
    }
}

// ───────────────────────────────────────────────────────────────────
// Typed payloads, one per document event kind
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCreatedPayload {
    pub table: Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdatedPayload {
    pub table_id: Uuid,
    pub changes: TableChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDeletedPayload {
    pub table_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnCreatedPayload {
    pub table_id: Uuid,
    pub field: Field,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnUpdatedPayload {
    pub table_id: Uuid,
    pub field_id: Uuid,
    pub field: FieldChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDeletedPayload {
    pub table_id: Uuid,
    pub field_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCreatedPayload {
    pub table_id: Uuid,
    pub index: Index,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexUpdatedPayload {
    pub table_id: Uuid,
    pub index_id: Uuid,
    pub index: IndexChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDeletedPayload {
    pub table_id: Uuid,
    pub index_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipCreatedPayload {
    pub relationship: Relationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipUpdatedPayload {
    pub relationship_id: Uuid,
    pub changes: RelationshipChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDeletedPayload {
    pub relationship_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaCreatedPayload {
    pub area: Area,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaUpdatedPayload {
    pub area_id: Uuid,
    pub changes: AreaChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaDeletedPayload {
    pub area_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteCreatedPayload {
    pub note: Note,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteUpdatedPayload {
    pub note_id: Uuid,
    pub changes: NoteChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDeletedPayload {
    pub note_id: Uuid,
}

// ───────────────────────────────────────────────────────────────────
// Presence-family payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovedPayload {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChangedPayload {
    #[serde(default)]
    pub element_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementLockPayload {
    pub element_type: String,
    pub element_id: Uuid,
}
