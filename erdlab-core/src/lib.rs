//! # erdlab-core — schema document model for erdlab
//!
//! Owns the in-memory representation of one schema diagram: tables with
//! their columns and indexes, relationships, annotation areas, and notes.
//!
//! The model exposes a mutation API in which every operation accepts a
//! [`HistoryOpts`] — mutations applied on behalf of a remote peer pass
//! `HistoryOpts::skip()` so they never land in the local undo log.
//! Every mutation (recorded or not) emits a typed [`DocumentEvent`] to
//! registered listeners, which is the seam the synchronization engine in
//! `erdlab-collab` hangs off.
//!
//! ## Modules
//!
//! - [`schema`] — entity types and their partial-update ("changes") types
//! - [`document`] — the [`Document`] container and its mutation API
//! - [`history`] — bounded undo log

pub mod document;
pub mod history;
pub mod schema;

pub use document::{Document, DocumentError, DocumentEvent, HistoryOpts, ListenerId};
pub use history::{History, HistoryEntry};
pub use schema::{
    Area, AreaChanges, Cardinality, Field, FieldChanges, Index, IndexChanges, Note, NoteChanges,
    Relationship, RelationshipChanges, Table, TableChanges,
};
