//! Schema entity types and their partial-update counterparts.
//!
//! Every entity serializes with camelCase field names — these shapes travel
//! verbatim inside wire-event payloads, so the names are part of the
//! client/server contract.
//!
//! Each `*Changes` struct mirrors its entity with every field optional.
//! `apply` copies the present fields onto the target (last writer wins per
//! field); absent fields leave the target untouched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relationship cardinality between two tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: Uuid,
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
}

/// An index over one or more columns of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub field_ids: Vec<Uuid>,
    #[serde(default)]
    pub unique: bool,
}

/// A table with position, columns and indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub indexes: Vec<Index>,
}

/// A foreign-key style relationship between two columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub source_table_id: Uuid,
    pub source_field_id: Uuid,
    pub target_table_id: Uuid,
    pub target_field_id: Uuid,
    pub cardinality: Cardinality,
}

/// A rectangular grouping area drawn behind tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub color: Option<String>,
}

/// A free-floating text note on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: Uuid,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub color: Option<String>,
}

/// Partial update for a [`Table`] (position, name, color).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableChanges {
    pub name: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub color: Option<String>,
}

impl TableChanges {
    pub fn apply(&self, table: &mut Table) {
        if let Some(name) = &self.name {
            table.name = name.clone();
        }
        if let Some(x) = self.x {
            table.x = x;
        }
        if let Some(y) = self.y {
            table.y = y;
        }
        if let Some(color) = &self.color {
            table.color = Some(color.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.x.is_none() && self.y.is_none() && self.color.is_none()
    }
}

/// Partial update for a [`Field`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldChanges {
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub nullable: Option<bool>,
    pub primary_key: Option<bool>,
    pub unique: Option<bool>,
}

impl FieldChanges {
    pub fn apply(&self, field: &mut Field) {
        if let Some(name) = &self.name {
            field.name = name.clone();
        }
        if let Some(data_type) = &self.data_type {
            field.data_type = data_type.clone();
        }
        if let Some(nullable) = self.nullable {
            field.nullable = nullable;
        }
        if let Some(primary_key) = self.primary_key {
            field.primary_key = primary_key;
        }
        if let Some(unique) = self.unique {
            field.unique = unique;
        }
    }
}

/// Partial update for an [`Index`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexChanges {
    pub name: Option<String>,
    pub field_ids: Option<Vec<Uuid>>,
    pub unique: Option<bool>,
}

impl IndexChanges {
    pub fn apply(&self, index: &mut Index) {
        if let Some(name) = &self.name {
            index.name = name.clone();
        }
        if let Some(field_ids) = &self.field_ids {
            index.field_ids = field_ids.clone();
        }
        if let Some(unique) = self.unique {
            index.unique = unique;
        }
    }
}

/// Partial update for a [`Relationship`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationshipChanges {
    pub name: Option<String>,
    pub cardinality: Option<Cardinality>,
    pub source_field_id: Option<Uuid>,
    pub target_field_id: Option<Uuid>,
}

impl RelationshipChanges {
    pub fn apply(&self, relationship: &mut Relationship) {
        if let Some(name) = &self.name {
            relationship.name = Some(name.clone());
        }
        if let Some(cardinality) = self.cardinality {
            relationship.cardinality = cardinality;
        }
        if let Some(id) = self.source_field_id {
            relationship.source_field_id = id;
        }
        if let Some(id) = self.target_field_id {
            relationship.target_field_id = id;
        }
    }
}

/// Partial update for an [`Area`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AreaChanges {
    pub name: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub color: Option<String>,
}

impl AreaChanges {
    pub fn apply(&self, area: &mut Area) {
        if let Some(name) = &self.name {
            area.name = name.clone();
        }
        if let Some(x) = self.x {
            area.x = x;
        }
        if let Some(y) = self.y {
            area.y = y;
        }
        if let Some(width) = self.width {
            area.width = width;
        }
        if let Some(height) = self.height {
            area.height = height;
        }
        if let Some(color) = &self.color {
            area.color = Some(color.clone());
        }
    }
}

/// Partial update for a [`Note`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoteChanges {
    pub content: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub color: Option<String>,
}

impl NoteChanges {
    pub fn apply(&self, note: &mut Note) {
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(x) = self.x {
            note.x = x;
        }
        if let Some(y) = self.y {
            note.y = y;
        }
        if let Some(width) = self.width {
            note.width = width;
        }
        if let Some(height) = self.height {
            note.height = height;
        }
        if let Some(color) = &self.color {
            note.color = Some(color.clone());
        }
    }
}

impl Table {
    /// Convenience constructor for a positioned, empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            x: 0.0,
            y: 0.0,
            color: None,
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            unique: false,
        }
    }
}

impl Note {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            x: 0.0,
            y: 0.0,
            width: 200.0,
            height: 120.0,
            color: None,
        }
    }
}
