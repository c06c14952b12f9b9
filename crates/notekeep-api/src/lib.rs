//! Operation layer between the HTTP surface and the content store.
//!
//! Boundary validation happens here: empty fields are rejected and legacy
//! wire ids (`0` for "root" / "uncategorized") are normalized before any
//! store call, so the store only ever sees well-formed input.

use std::path::PathBuf;

use notekeep_core::{
    validate_collection_name, validate_note_fields, Collection, CollectionId, CollectionUpdate,
    DomainError, Note, NoteId, NoteSummary, NoteUpdate,
};
use notekeep_store_sqlite::{SqliteStore, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateCollectionRequest {
    pub name: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateCollectionRequest {
    pub name: Option<String>,
    pub parent_id: Option<i64>,
    pub locked: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateNoteRequest {
    pub title: String,
    pub contents: String,
    pub collection_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateNoteRequest {
    pub title: Option<String>,
    pub contents: Option<String>,
    pub collection_id: Option<i64>,
}

/// Handle over the content store; holds the database path and opens a
/// migrated store per operation. Concurrent writers serialize through the
/// store's own transaction mechanism.
#[derive(Debug, Clone)]
pub struct NotekeepApi {
    db_path: PathBuf,
}

impl NotekeepApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, StoreError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Create a collection and return its generated id.
    ///
    /// # Errors
    /// Returns a validation error for an empty name, and an integrity error
    /// when the parent does not exist.
    pub fn create_collection(
        &self,
        request: CreateCollectionRequest,
    ) -> Result<CollectionId, ApiError> {
        validate_collection_name(&request.name)?;
        let mut store = self.open_store()?;
        let parent_id = CollectionId::from_wire(request.parent_id);
        Ok(store.create_collection(&request.name, parent_id)?)
    }

    /// # Errors
    /// Returns a not-found error when the id is absent.
    pub fn read_collection(&self, id: i64) -> Result<Collection, ApiError> {
        Ok(self.open_store()?.read_collection(CollectionId(id))?)
    }

    /// List collections, optionally filtered by parent (`0` selects roots).
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_collections(&self, parent: Option<i64>) -> Result<Vec<Collection>, ApiError> {
        let store = self.open_store()?;
        match parent {
            None => Ok(store.list_collections()?),
            Some(raw) => Ok(store.list_collections_by_parent(CollectionId::from_wire(Some(raw)))?),
        }
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn search_collections(&self, query: &str) -> Result<Vec<Collection>, ApiError> {
        Ok(self.open_store()?.search_collections(query)?)
    }

    /// Apply a partial update to a collection and return the changed-row
    /// count.
    ///
    /// # Errors
    /// Returns a validation error for an empty replacement name, a not-found
    /// error when the id is absent, and an integrity error for a missing
    /// parent, a cycle, or a locked target.
    pub fn update_collection(
        &self,
        id: i64,
        request: UpdateCollectionRequest,
    ) -> Result<usize, ApiError> {
        if let Some(name) = request.name.as_deref() {
            validate_collection_name(name)?;
        }
        let fields = CollectionUpdate {
            name: request.name,
            parent_id: request.parent_id.map(|raw| CollectionId::from_wire(Some(raw))),
            locked: request.locked,
        };
        let mut store = self.open_store()?;
        Ok(store.update_collection(CollectionId(id), &fields)?)
    }

    /// # Errors
    /// Returns a not-found error when the id is absent and an integrity
    /// error while children or notes still reference the collection.
    pub fn delete_collection(&self, id: i64) -> Result<usize, ApiError> {
        Ok(self.open_store()?.delete_collection(CollectionId(id))?)
    }

    /// Create a note and return its generated id.
    ///
    /// # Errors
    /// Returns a validation error for empty title/contents and an integrity
    /// error when the collection does not exist.
    pub fn create_note(&self, request: CreateNoteRequest) -> Result<NoteId, ApiError> {
        validate_note_fields(Some(request.title.as_str()), Some(request.contents.as_str()))?;
        let mut store = self.open_store()?;
        let collection_id = CollectionId::from_wire(request.collection_id);
        Ok(store.create_note(&request.title, &request.contents, collection_id)?)
    }

    /// # Errors
    /// Returns a not-found error when the id is absent.
    pub fn read_note(&self, id: i64) -> Result<Note, ApiError> {
        Ok(self.open_store()?.read_note(NoteId(id))?)
    }

    /// List note summaries, optionally filtered by collection (`0` selects
    /// uncategorized notes).
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_notes(&self, collection: Option<i64>) -> Result<Vec<NoteSummary>, ApiError> {
        let store = self.open_store()?;
        match collection {
            None => Ok(store.list_notes()?),
            Some(raw) => {
                Ok(store.list_notes_by_collection(CollectionId::from_wire(Some(raw)))?)
            }
        }
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn search_notes(&self, query: &str) -> Result<Vec<NoteSummary>, ApiError> {
        Ok(self.open_store()?.search_notes_by_title(query)?)
    }

    /// Apply a partial update to a note and return the changed-row count.
    /// `modify_at` is refreshed even when the field set changes nothing.
    ///
    /// # Errors
    /// Returns a validation error for empty replacement fields, a not-found
    /// error when the id is absent, and an integrity error for a missing
    /// collection.
    pub fn update_note(&self, id: i64, request: UpdateNoteRequest) -> Result<usize, ApiError> {
        validate_note_fields(request.title.as_deref(), request.contents.as_deref())?;
        let fields = NoteUpdate {
            title: request.title,
            contents: request.contents,
            collection_id: request.collection_id.map(|raw| CollectionId::from_wire(Some(raw))),
        };
        let mut store = self.open_store()?;
        Ok(store.update_note(NoteId(id), &fields)?)
    }

    /// # Errors
    /// Returns a not-found error when the id is absent.
    pub fn delete_note(&self, id: i64) -> Result<usize, ApiError> {
        Ok(self.open_store()?.delete_note(NoteId(id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_api() -> Result<(NotekeepApi, tempfile::TempDir), std::io::Error> {
        let dir = tempfile::tempdir()?;
        let api = NotekeepApi::new(dir.path().join("notekeep.sqlite3"));
        Ok((api, dir))
    }

    #[test]
    fn collection_and_note_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
        let (api, _dir) = temp_api()?;

        let work = api.create_collection(CreateCollectionRequest {
            name: "Work".to_string(),
            parent_id: None,
        })?;
        assert_eq!(work.get(), 1);

        let note = api.create_note(CreateNoteRequest {
            title: "Plan".to_string(),
            contents: "# Plan".to_string(),
            collection_id: Some(work.get()),
        })?;
        assert_eq!(note.get(), 1);

        let listed = api.list_notes(Some(work.get()))?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Plan");

        // Still referenced by the note, so the delete must be refused.
        assert!(matches!(
            api.delete_collection(work.get()),
            Err(ApiError::Store(StoreError::Integrity(_)))
        ));

        assert_eq!(api.delete_note(note.get())?, 1);
        assert_eq!(api.delete_collection(work.get())?, 1);
        Ok(())
    }

    #[test]
    fn empty_fields_never_reach_the_store() -> Result<(), Box<dyn std::error::Error>> {
        let (api, _dir) = temp_api()?;

        assert!(matches!(
            api.create_collection(CreateCollectionRequest {
                name: "  ".to_string(),
                parent_id: None
            }),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            api.create_note(CreateNoteRequest {
                title: "Plan".to_string(),
                contents: String::new(),
                collection_id: None,
            }),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            api.update_note(
                1,
                UpdateNoteRequest { title: Some(String::new()), ..UpdateNoteRequest::default() }
            ),
            Err(ApiError::Validation(_))
        ));

        assert!(api.list_collections(None)?.is_empty());
        assert!(api.list_notes(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn wire_zero_selects_roots_and_uncategorized() -> Result<(), Box<dyn std::error::Error>> {
        let (api, _dir) = temp_api()?;

        let root = api.create_collection(CreateCollectionRequest {
            name: "Work".to_string(),
            parent_id: Some(0),
        })?;
        api.create_collection(CreateCollectionRequest {
            name: "Reports".to_string(),
            parent_id: Some(root.get()),
        })?;
        api.create_note(CreateNoteRequest {
            title: "Scratch".to_string(),
            contents: "...".to_string(),
            collection_id: Some(0),
        })?;

        let roots = api.list_collections(Some(0))?;
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "Work");
        assert_eq!(roots[0].parent_id, None);

        let uncategorized = api.list_notes(Some(0))?;
        assert_eq!(uncategorized.len(), 1);
        assert_eq!(uncategorized[0].title, "Scratch");
        Ok(())
    }

    #[test]
    fn refile_note_to_root_via_wire_zero() -> Result<(), Box<dyn std::error::Error>> {
        let (api, _dir) = temp_api()?;

        let work = api.create_collection(CreateCollectionRequest {
            name: "Work".to_string(),
            parent_id: None,
        })?;
        let note = api.create_note(CreateNoteRequest {
            title: "Plan".to_string(),
            contents: "# Plan".to_string(),
            collection_id: Some(work.get()),
        })?;

        let changed = api.update_note(
            note.get(),
            UpdateNoteRequest { collection_id: Some(0), ..UpdateNoteRequest::default() },
        )?;
        assert_eq!(changed, 1);
        assert_eq!(api.read_note(note.get())?.collection_id, None);
        Ok(())
    }

    #[test]
    fn search_spans_collections_and_notes() -> Result<(), Box<dyn std::error::Error>> {
        let (api, _dir) = temp_api()?;

        api.create_collection(CreateCollectionRequest {
            name: "Work".to_string(),
            parent_id: None,
        })?;
        api.create_note(CreateNoteRequest {
            title: "Workout log".to_string(),
            contents: "...".to_string(),
            collection_id: None,
        })?;

        assert_eq!(api.search_collections("wor")?.len(), 1);
        assert_eq!(api.search_notes("WOR")?.len(), 1);
        assert!(api.search_notes("absent")?.is_empty());
        Ok(())
    }
}
