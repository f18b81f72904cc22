// Embedding/Lexical Store
//
// One handle wraps a single-owner SQLite connection on the notes database.
// The handle is intentionally not shareable across threads; workers either
// pin a handle to a thread or open a fresh one on the same file.
//
// The store owns the chunk-embedding table, the FTS5 index over notes and
// the triggers that keep the FTS index consistent with the notes table.
// Cosine distance comes from the sqlite-vec extension, registered
// process-wide before the first connection opens.

use std::path::{Path, PathBuf};
use std::sync::Once;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Vector extension unavailable: {0}")]
    VectorExtension(String),

    #[error("{0}")]
    Message(String),
}

/// A note row as consumed by the indexing pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub updated_at: String,
}

/// A retrieval candidate. `content` starts as chunk text (vector hits) or
/// full note content (BM25 hits) and is replaced by the best-matching chunk
/// during hydration. The distance and RRF score are carried for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedNote {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub cosine_distance: Option<f64>,
    pub rrf_score: Option<f64>,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS note_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    note_id INTEGER NOT NULL,
    chunk_index INTEGER NOT NULL DEFAULT 0,
    chunk_text TEXT NOT NULL DEFAULT '',
    vector BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(note_id, chunk_index),
    FOREIGN KEY(note_id) REFERENCES notes(id) ON DELETE CASCADE
);
"#;

const FTS_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS notes_fts
    USING fts5(title, content, content=notes, content_rowid=id);

CREATE TRIGGER IF NOT EXISTS notes_fts_insert
    AFTER INSERT ON notes BEGIN
    INSERT INTO notes_fts(rowid, title, content)
        VALUES (new.id, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS notes_fts_update
    AFTER UPDATE OF title, content ON notes BEGIN
    INSERT INTO notes_fts(notes_fts, rowid, title, content)
        VALUES ('delete', old.id, old.title, old.content);
    INSERT INTO notes_fts(rowid, title, content)
        VALUES (new.id, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS notes_fts_delete
    AFTER DELETE ON notes BEGIN
    INSERT INTO notes_fts(notes_fts, rowid, title, content)
        VALUES ('delete', old.id, old.title, old.content);
END;
"#;

static REGISTER_VEC: Once = Once::new();

fn register_vector_extension() {
    REGISTER_VEC.call_once(|| unsafe {
        // Registers vec_* SQL functions on every connection opened afterwards
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up.
    /// Fails when the vector extension cannot be verified.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        register_vector_extension();
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn,
            path: path.as_ref().to_path_buf(),
        };
        store.initialize()?;
        Ok(store)
    }

    /// In-memory store for tests and scratch work. Each handle is its own
    /// private database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        register_vector_extension();
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn
            .query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
            .map_err(|e| {
                StoreError::VectorExtension(format!(
                    "sqlite-vec is required for vector search but could not be loaded: {}",
                    e
                ))
            })?;
        self.migrate_legacy_chunks()?;
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.conn.execute_batch(FTS_SQL)?;
        self.rebuild_fts_if_empty()?;
        Ok(())
    }

    /// Databases written before chunked BLOB storage kept one text-encoded
    /// vector per note. Those vectors cannot be queried by the distance
    /// function, so the table is dropped and the index reports empty until
    /// the next rebuild.
    fn migrate_legacy_chunks(&self) -> Result<(), StoreError> {
        let exists: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'note_embeddings'",
            [],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(());
        }
        let mut stmt = self.conn.prepare("PRAGMA table_info(note_embeddings)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        let legacy = columns.iter().any(|c| c == "vector_json")
            || !columns.iter().any(|c| c == "chunk_index");
        if legacy {
            log::warn!(
                "[store] Dropping legacy note_embeddings table; embeddings must be regenerated"
            );
            self.conn.execute("DROP TABLE note_embeddings", [])?;
        }
        Ok(())
    }

    /// Populate the FTS index from the notes table when it is empty, e.g. on
    /// the first startup over a database created before the index existed.
    fn rebuild_fts_if_empty(&self) -> Result<(), StoreError> {
        let fts_rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM notes_fts", [], |row| row.get(0))?;
        let note_rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
        if fts_rows == 0 && note_rows > 0 {
            log::info!("[store] Rebuilding FTS index from {} notes", note_rows);
            self.conn
                .execute("INSERT INTO notes_fts(notes_fts) VALUES ('rebuild')", [])?;
        }
        Ok(())
    }

    // -- note surface (consumed by the index; the CRUD layer proper lives
    // -- outside this crate) ------------------------------------------------

    pub fn create_note(&self, title: &str, content: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO notes (title, content) VALUES (?1, ?2)",
            params![title, content],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_note(&self, note_id: i64, title: &str, content: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE notes SET title = ?1, content = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![title, content, note_id],
        )?;
        Ok(())
    }

    pub fn delete_note(&self, note_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM notes WHERE id = ?1", params![note_id])?;
        Ok(())
    }

    pub fn get_note(&self, note_id: i64) -> Result<Option<NoteRecord>, StoreError> {
        let note = self
            .conn
            .query_row(
                "SELECT id, title, content, updated_at FROM notes WHERE id = ?1",
                params![note_id],
                |row| {
                    Ok(NoteRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(note)
    }

    pub fn list_notes_for_embedding(&self) -> Result<Vec<NoteRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, content, updated_at FROM notes ORDER BY id")?;
        let notes = stmt
            .query_map([], |row| {
                Ok(NoteRecord {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    // -- chunk embeddings ----------------------------------------------------

    /// Atomically replace all chunks of a note. Chunk indices are assigned
    /// contiguously from 0 in input order; readers see either the old set or
    /// the new set, never a mix.
    pub fn replace_chunks(
        &mut self,
        note_id: i64,
        chunks: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM note_embeddings WHERE note_id = ?1",
            params![note_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO note_embeddings (note_id, chunk_index, chunk_text, vector, updated_at)
                 VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)",
            )?;
            for (index, (text, blob)) in chunks.iter().enumerate() {
                stmt.execute(params![note_id, index as i64, text, blob])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Erase every chunk; used before a full rebuild.
    pub fn clear_all_chunks(&self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM note_embeddings", [])?;
        Ok(())
    }

    pub fn chunk_count(&self, note_id: i64) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM note_embeddings WHERE note_id = ?1",
            params![note_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn chunk_indices(&self, note_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_index FROM note_embeddings WHERE note_id = ?1 ORDER BY chunk_index",
        )?;
        let indices = stmt
            .query_map(params![note_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(indices)
    }

    // -- search --------------------------------------------------------------

    /// Nearest notes by cosine distance between the query vector and any of
    /// the note's chunks; one row per note, closest chunk's text as content.
    pub fn vector_search(
        &self,
        query_blob: &[u8],
        k: usize,
    ) -> Result<Vec<RetrievedNote>, StoreError> {
        let chunk_rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM note_embeddings", [], |row| row.get(0))?;
        if chunk_rows == 0 {
            log::warn!("[store] Vector search over an empty index");
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT n.id, n.title, ne.chunk_text,
                    MIN(vec_distance_cosine(ne.vector, ?1)) AS cosine_distance
             FROM notes n
             JOIN note_embeddings ne ON ne.note_id = n.id
             GROUP BY n.id
             ORDER BY cosine_distance ASC
             LIMIT ?2",
        )?;
        let results = stmt
            .query_map(params![query_blob, k as i64], |row| {
                Ok(RetrievedNote {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    cosine_distance: row.get(3)?,
                    rrf_score: None,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(results)
    }

    /// Lexical search over note titles and content, best BM25 rank first.
    /// The query is sanitized first; FTS engine errors degrade to an empty
    /// result instead of propagating.
    pub fn bm25_search(&self, raw_query: &str, k: usize) -> Vec<RetrievedNote> {
        let sanitized = sanitize_fts_query(raw_query);
        if sanitized.is_empty() {
            return Vec::new();
        }
        match self.bm25_search_sanitized(&sanitized, k) {
            Ok(results) => results,
            Err(e) => {
                log::warn!("[store] BM25 search failed for query '{}': {}", sanitized, e);
                Vec::new()
            }
        }
    }

    fn bm25_search_sanitized(
        &self,
        match_query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedNote>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT n.id, n.title, n.content
             FROM notes_fts
             JOIN notes n ON n.id = notes_fts.rowid
             WHERE notes_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let results = stmt
            .query_map(params![match_query, k as i64], |row| {
                Ok(RetrievedNote {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    cosine_distance: None,
                    rrf_score: None,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(results)
    }

    /// Text of the chunk of `note_id` closest to the query vector.
    pub fn best_chunk_text(
        &self,
        note_id: i64,
        query_blob: &[u8],
    ) -> Result<Option<String>, StoreError> {
        let text = self
            .conn
            .query_row(
                "SELECT chunk_text FROM note_embeddings
                 WHERE note_id = ?1
                 ORDER BY vec_distance_cosine(vector, ?2) ASC
                 LIMIT 1",
                params![note_id, query_blob],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text)
    }
}

/// Strip FTS5 meta-characters and wrap every surviving token in double
/// quotes, so multi-word queries match as implicit AND without any operator
/// injection. Returns the empty string iff no token survives.
pub fn sanitize_fts_query(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '^' | '*' | '(' | ')' | '[' | ']'))
        .collect();
    cleaned
        .split_whitespace()
        .map(|token| format!("\"{}\"", token))
        .collect::<Vec<_>>()
        .join(" ")
}
