//! SQLite-backed content store for collections and notes.
//!
//! Every mutation wraps its check-then-act sequence in one transaction, so
//! referential-integrity decisions and the write they guard observe the same
//! snapshot. Reads are plain queries; listing and search results come back
//! in insertion order (ascending id).

use std::path::Path;

use notekeep_core::{
    Collection, CollectionId, CollectionUpdate, Note, NoteId, NoteSummary, NoteUpdate,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Upper bound on the ancestor walk; a well-formed tree never gets near it.
const MAX_TREE_DEPTH: usize = 64;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS collections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id INTEGER,
  name TEXT NOT NULL,
  locked INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (parent_id) REFERENCES collections(id)
);

CREATE TABLE IF NOT EXISTS notes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  collection_id INTEGER,
  title TEXT NOT NULL,
  modify_at TEXT NOT NULL,
  contents TEXT NOT NULL,
  FOREIGN KEY (collection_id) REFERENCES collections(id)
);

CREATE INDEX IF NOT EXISTS idx_collections_parent ON collections(parent_id);
CREATE INDEX IF NOT EXISTS idx_notes_collection ON notes(collection_id);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },
    #[error("unsupported schema version {found}; expected {expected}")]
    Schema { found: i64, expected: i64 },
    #[error("invalid stored timestamp: {0}")]
    Timestamp(String),
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open the store file and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::configure(Connection::open(path)?)
    }

    /// Open a fresh in-memory store; used by tests and fixtures.
    ///
    /// # Errors
    /// Returns an error when the database cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    /// Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails, or when the file carries a newer schema than this build knows.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;

        if current_schema_version(&self.conn)? < 1 {
            let tx = self.conn.transaction()?;
            tx.execute_batch(MIGRATION_001_SQL)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )?;
            tx.commit()?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::Schema { found: version, expected: LATEST_SCHEMA_VERSION });
        }
        Ok(())
    }

    /// Create a collection, optionally nested under an existing parent.
    ///
    /// # Errors
    /// Returns [`StoreError::Integrity`] when `parent_id` references no
    /// existing collection.
    pub fn create_collection(
        &mut self,
        name: &str,
        parent_id: Option<CollectionId>,
    ) -> Result<CollectionId, StoreError> {
        let tx = self.conn.transaction()?;
        if let Some(parent) = parent_id {
            ensure_parent_exists(&tx, parent)?;
        }
        tx.execute(
            "INSERT INTO collections(parent_id, name, locked) VALUES (?1, ?2, 0)",
            params![parent_id.map(CollectionId::get), name],
        )?;
        let id = CollectionId(tx.last_insert_rowid());
        tx.commit()?;
        Ok(id)
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no collection has this id.
    pub fn read_collection(&self, id: CollectionId) -> Result<Collection, StoreError> {
        fetch_collection(&self.conn, id)?
            .ok_or(StoreError::NotFound { entity: "collection", id: id.get() })
    }

    /// List every collection in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parent_id, name, locked FROM collections ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], collection_from_row)?;
        collect_rows(rows)
    }

    /// List collections under one parent; `None` selects root collections.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_collections_by_parent(
        &self,
        parent_id: Option<CollectionId>,
    ) -> Result<Vec<Collection>, StoreError> {
        match parent_id {
            Some(parent) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, parent_id, name, locked FROM collections
                     WHERE parent_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![parent.get()], collection_from_row)?;
                collect_rows(rows)
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, parent_id, name, locked FROM collections
                     WHERE parent_id IS NULL ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([], collection_from_row)?;
                collect_rows(rows)
            }
        }
    }

    /// Case-insensitive substring search over collection names.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn search_collections(&self, query: &str) -> Result<Vec<Collection>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parent_id, name, locked FROM collections
             WHERE name LIKE ?1 ESCAPE '\\' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![like_pattern(query)], collection_from_row)?;
        collect_rows(rows)
    }

    /// Apply a partial update to a collection.
    ///
    /// Reparenting checks that the new parent exists and that the new
    /// ancestor chain never reaches the updated collection. A locked
    /// collection rejects name/parent changes; the `locked` flag itself can
    /// always be toggled.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the id is absent and
    /// [`StoreError::Integrity`] on a missing parent, a cycle, or a locked
    /// target.
    pub fn update_collection(
        &mut self,
        id: CollectionId,
        fields: &CollectionUpdate,
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let current = fetch_collection(&tx, id)?
            .ok_or(StoreError::NotFound { entity: "collection", id: id.get() })?;

        if current.locked && (fields.name.is_some() || fields.parent_id.is_some()) {
            return Err(StoreError::Integrity(format!("collection {id} is locked")));
        }

        let parent_id = match fields.parent_id {
            Some(new_parent) => {
                if let Some(parent) = new_parent {
                    ensure_parent_exists(&tx, parent)?;
                    ensure_no_cycle(&tx, id, parent)?;
                }
                new_parent
            }
            None => current.parent_id,
        };
        let name = fields.name.as_deref().unwrap_or(&current.name);
        let locked = fields.locked.unwrap_or(current.locked);

        let changed = tx.execute(
            "UPDATE collections SET parent_id = ?1, name = ?2, locked = ?3 WHERE id = ?4",
            params![parent_id.map(CollectionId::get), name, locked, id.get()],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    /// Delete a collection with no remaining children.
    ///
    /// Deletion never cascades: while child collections or notes still
    /// reference the id, the caller must re-parent or delete them first.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the id is absent and
    /// [`StoreError::Integrity`] when the collection is locked or still
    /// referenced.
    pub fn delete_collection(&mut self, id: CollectionId) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let current = fetch_collection(&tx, id)?
            .ok_or(StoreError::NotFound { entity: "collection", id: id.get() })?;

        if current.locked {
            return Err(StoreError::Integrity(format!("collection {id} is locked")));
        }
        if exists(&tx, "SELECT EXISTS(SELECT 1 FROM collections WHERE parent_id = ?1)", id.get())? {
            return Err(StoreError::Integrity(format!(
                "collection {id} still has child collections"
            )));
        }
        if exists(&tx, "SELECT EXISTS(SELECT 1 FROM notes WHERE collection_id = ?1)", id.get())? {
            return Err(StoreError::Integrity(format!("collection {id} still has notes")));
        }

        let changed = tx.execute("DELETE FROM collections WHERE id = ?1", params![id.get()])?;
        tx.commit()?;
        Ok(changed)
    }

    /// Create a note; `modify_at` is stamped with the current time.
    ///
    /// # Errors
    /// Returns [`StoreError::Integrity`] when `collection_id` references no
    /// existing collection.
    pub fn create_note(
        &mut self,
        title: &str,
        contents: &str,
        collection_id: Option<CollectionId>,
    ) -> Result<NoteId, StoreError> {
        let tx = self.conn.transaction()?;
        if let Some(collection) = collection_id {
            ensure_collection_exists(&tx, collection)?;
        }
        tx.execute(
            "INSERT INTO notes(collection_id, title, modify_at, contents)
             VALUES (?1, ?2, ?3, ?4)",
            params![collection_id.map(CollectionId::get), title, now_rfc3339()?, contents],
        )?;
        let id = NoteId(tx.last_insert_rowid());
        tx.commit()?;
        Ok(id)
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no note has this id.
    pub fn read_note(&self, id: NoteId) -> Result<Note, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, collection_id, title, modify_at, contents FROM notes WHERE id = ?1",
                params![id.get()],
                note_parts_from_row,
            )
            .optional()?;

        match row {
            Some(parts) => note_from_parts(parts),
            None => Err(StoreError::NotFound { entity: "note", id: id.get() }),
        }
    }

    /// List `{id, title}` summaries of every note in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_notes(&self) -> Result<Vec<NoteSummary>, StoreError> {
        let mut stmt =
            self.conn.prepare("SELECT id, title FROM notes ORDER BY id ASC")?;
        let rows = stmt.query_map([], summary_from_row)?;
        collect_rows(rows)
    }

    /// List note summaries for one collection; `None` selects uncategorized
    /// notes.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_notes_by_collection(
        &self,
        collection_id: Option<CollectionId>,
    ) -> Result<Vec<NoteSummary>, StoreError> {
        match collection_id {
            Some(collection) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, title FROM notes WHERE collection_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![collection.get()], summary_from_row)?;
                collect_rows(rows)
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, title FROM notes WHERE collection_id IS NULL ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([], summary_from_row)?;
                collect_rows(rows)
            }
        }
    }

    /// Case-insensitive substring search over note titles.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn search_notes_by_title(&self, query: &str) -> Result<Vec<NoteSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title FROM notes WHERE title LIKE ?1 ESCAPE '\\' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![like_pattern(query)], summary_from_row)?;
        collect_rows(rows)
    }

    /// Apply a partial update to a note.
    ///
    /// `modify_at` is refreshed on every successful update, even when the
    /// supplied field set changes nothing.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the id is absent and
    /// [`StoreError::Integrity`] when the new `collection_id` references no
    /// existing collection.
    pub fn update_note(&mut self, id: NoteId, fields: &NoteUpdate) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT id, collection_id, title, modify_at, contents FROM notes WHERE id = ?1",
                params![id.get()],
                note_parts_from_row,
            )
            .optional()?
            .map(note_from_parts)
            .transpose()?
            .ok_or(StoreError::NotFound { entity: "note", id: id.get() })?;

        let collection_id = match fields.collection_id {
            Some(new_collection) => {
                if let Some(collection) = new_collection {
                    ensure_collection_exists(&tx, collection)?;
                }
                new_collection
            }
            None => current.collection_id,
        };
        let title = fields.title.as_deref().unwrap_or(&current.title);
        let contents = fields.contents.as_deref().unwrap_or(&current.contents);

        let changed = tx.execute(
            "UPDATE notes SET collection_id = ?1, title = ?2, modify_at = ?3, contents = ?4
             WHERE id = ?5",
            params![collection_id.map(CollectionId::get), title, now_rfc3339()?, contents, id.get()],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no note has this id.
    pub fn delete_note(&mut self, id: NoteId) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute("DELETE FROM notes WHERE id = ?1", params![id.get()])?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "note", id: id.get() });
        }
        tx.commit()?;
        Ok(changed)
    }
}

type CollectionRow = (i64, Option<i64>, String, bool);
type NoteRow = (i64, Option<i64>, String, String, String);

fn collection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    let (id, parent_id, name, locked): CollectionRow =
        (row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?);
    Ok(Collection { id: CollectionId(id), parent_id: parent_id.map(CollectionId), name, locked })
}

fn note_parts_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NoteRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn note_from_parts(parts: NoteRow) -> Result<Note, StoreError> {
    let (id, collection_id, title, modify_at, contents) = parts;
    Ok(Note {
        id: NoteId(id),
        collection_id: collection_id.map(CollectionId),
        title,
        modify_at: parse_rfc3339(&modify_at)?,
        contents,
    })
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NoteSummary> {
    Ok(NoteSummary { id: NoteId(row.get(0)?), title: row.get(1)? })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn fetch_collection(
    conn: &Connection,
    id: CollectionId,
) -> Result<Option<Collection>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, parent_id, name, locked FROM collections WHERE id = ?1",
            params![id.get()],
            collection_from_row,
        )
        .optional()?;
    Ok(row)
}

fn exists(conn: &Connection, query: &str, id: i64) -> Result<bool, StoreError> {
    let found = conn.query_row(query, params![id], |row| row.get::<_, i64>(0))?;
    Ok(found == 1)
}

fn ensure_parent_exists(tx: &Transaction<'_>, parent: CollectionId) -> Result<(), StoreError> {
    if exists(tx, "SELECT EXISTS(SELECT 1 FROM collections WHERE id = ?1)", parent.get())? {
        Ok(())
    } else {
        Err(StoreError::Integrity(format!("parent collection {parent} does not exist")))
    }
}

fn ensure_collection_exists(
    tx: &Transaction<'_>,
    collection: CollectionId,
) -> Result<(), StoreError> {
    if exists(tx, "SELECT EXISTS(SELECT 1 FROM collections WHERE id = ?1)", collection.get())? {
        Ok(())
    } else {
        Err(StoreError::Integrity(format!("collection {collection} does not exist")))
    }
}

/// Walk the ancestor chain from `new_parent` to the root; reaching `id`
/// (including `new_parent == id`) would turn the tree into a cycle.
fn ensure_no_cycle(
    tx: &Transaction<'_>,
    id: CollectionId,
    new_parent: CollectionId,
) -> Result<(), StoreError> {
    let mut cursor = Some(new_parent);
    let mut depth = 0_usize;

    while let Some(current) = cursor {
        if current == id {
            return Err(StoreError::Integrity(format!(
                "collection {id} cannot become its own descendant"
            )));
        }
        depth += 1;
        if depth > MAX_TREE_DEPTH {
            return Err(StoreError::Integrity(format!(
                "collection tree exceeds maximum depth of {MAX_TREE_DEPTH}"
            )));
        }
        cursor = tx
            .query_row(
                "SELECT parent_id FROM collections WHERE id = ?1",
                params![current.get()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten()
            .map(CollectionId);
    }

    Ok(())
}

fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    format!("%{escaped}%")
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn now_rfc3339() -> Result<String, StoreError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Timestamp(err.to_string()))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Timestamp(format!("{value}: {err}")))
}
