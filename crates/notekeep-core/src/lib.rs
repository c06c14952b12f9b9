use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Generated identifier of a collection row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CollectionId(pub i64);

impl CollectionId {
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }

    /// Decodes an optional wire id, treating the legacy value `0` as
    /// "no collection" (root parent / uncategorized note).
    #[must_use]
    pub fn from_wire(raw: Option<i64>) -> Option<Self> {
        match raw {
            None | Some(0) => None,
            Some(value) => Some(Self(value)),
        }
    }
}

impl Display for CollectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generated identifier of a note row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NoteId(pub i64);

impl NoteId {
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for NoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named folder for notes, optionally nested under another collection.
///
/// `parent_id = None` marks a root collection. The parent graph is kept
/// acyclic by the store; `locked` freezes the collection's own fields and
/// blocks its deletion, but never restricts its children.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Collection {
    pub id: CollectionId,
    pub parent_id: Option<CollectionId>,
    pub name: String,
    pub locked: bool,
}

/// A markdown document, optionally filed under one collection.
///
/// `modify_at` is owned by the store: set on create and refreshed on every
/// update, never accepted from a caller.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Note {
    pub id: NoteId,
    pub collection_id: Option<CollectionId>,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub modify_at: OffsetDateTime,
    pub contents: String,
}

/// Listing/search projection of a note; contents are omitted for list views.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NoteSummary {
    pub id: NoteId,
    pub title: String,
}

/// Partial update of a collection. `None` leaves a field untouched;
/// `parent_id` distinguishes "unchanged" (outer `None`) from "make root"
/// (`Some(None)`).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CollectionUpdate {
    pub name: Option<String>,
    pub parent_id: Option<Option<CollectionId>>,
    pub locked: Option<bool>,
}

/// Partial update of a note. Same `None` / `Some(None)` convention as
/// [`CollectionUpdate::parent_id`] for `collection_id`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub contents: Option<String>,
    pub collection_id: Option<Option<CollectionId>>,
}

/// Validate a collection name before it reaches the store.
///
/// # Errors
/// Returns [`DomainError::Validation`] when the name is empty or blank.
pub fn validate_collection_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::Validation("collection name must not be empty".to_string()));
    }
    Ok(())
}

/// Validate note title and contents before they reach the store.
///
/// # Errors
/// Returns [`DomainError::Validation`] when either field is empty or blank.
pub fn validate_note_fields(title: Option<&str>, contents: Option<&str>) -> Result<(), DomainError> {
    if let Some(title) = title {
        if title.trim().is_empty() {
            return Err(DomainError::Validation("note title must not be empty".to_string()));
        }
    }
    if let Some(contents) = contents {
        if contents.trim().is_empty() {
            return Err(DomainError::Validation("note contents must not be empty".to_string()));
        }
    }
    Ok(())
}
