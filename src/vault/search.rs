//! Derived full-text index over file records.
//!
//! The index can always be rebuilt from the catalog and the blobs, so
//! callers treat most failures here as warnings. Documents are validated
//! when they are read back; rows that do not fit [`SearchDocument`] come
//! back as [`RejectedDocument`]s.

use super::schema::{Category, SearchDocument};
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Deepest offset a page request may reach.
pub const DEFAULT_MAX_RESULT_WINDOW: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("search index does not exist")]
    Missing,
    #[error("search backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("invalid search query: {0}")]
    InvalidQuery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub documents: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDocument {
    pub id: Option<i64>,
    pub reason: String,
}

/// One page of documents read back from the index.
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    pub documents: Vec<SearchDocument>,
    pub rejected: Vec<RejectedDocument>,
    /// Total documents in the index, including any beyond the window.
    pub total: usize,
    /// Rows consumed from the index for this page (documents + rejected).
    pub consumed: usize,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document: SearchDocument,
    pub rank: f64,
}

/// Operations the reconciler needs from a search backend.
pub trait SearchIndex: Send + Sync {
    fn ping(&self) -> Result<(), IndexError>;
    fn index_exists(&self) -> Result<bool, IndexError>;
    /// Idempotent; a second call reports [`CreateOutcome::AlreadyExists`].
    fn create_index(&self) -> Result<CreateOutcome, IndexError>;
    /// Returns whether there was an index to delete.
    fn delete_index(&self) -> Result<bool, IndexError>;
    /// Insert or replace the document with `doc.id`.
    fn index_document(&self, doc: &SearchDocument) -> Result<(), IndexError>;
    fn delete_document(&self, id: i64) -> Result<bool, IndexError>;
    fn get_document(&self, id: i64) -> Result<Option<SearchDocument>, IndexError>;
    /// Documents in id order starting at offset `from`. Offsets past
    /// [`SearchIndex::max_result_window`] yield an empty page.
    fn get_page(&self, from: usize, size: usize) -> Result<IndexPage, IndexError>;
    fn stats(&self) -> Result<IndexStats, IndexError>;
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;
    fn max_result_window(&self) -> usize;
}

/// SQLite FTS5 implementation of [`SearchIndex`].
#[derive(Clone)]
pub struct SqliteSearchIndex {
    conn: Arc<Mutex<Connection>>,
    max_result_window: usize,
}

const DOC_COLUMNS: &str = "id, owner_id, original_filename, stored_filename, storage_path,
     subject, category, extension, size, created_at, content";

impl SqliteSearchIndex {
    pub fn open(db_path: &Path, max_result_window: usize) -> anyhow::Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open search index at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA cache_size   = -2000;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_result_window,
        })
    }

    /// Opens an existing index database for reading only.
    pub fn open_read_only(db_path: &Path, max_result_window: usize) -> anyhow::Result<Self> {
        if !db_path.is_file() {
            anyhow::bail!("search index {} does not exist", db_path.display());
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open search index at {} read-only", db_path.display()))?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_result_window,
        })
    }

    pub fn open_in_memory(max_result_window: usize) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            max_result_window,
        })
    }

    fn exists(conn: &Connection) -> Result<bool, IndexError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'documents'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn require(conn: &Connection) -> Result<(), IndexError> {
        if Self::exists(conn)? {
            Ok(())
        } else {
            Err(IndexError::Missing)
        }
    }

    fn row_to_document(row: &Row) -> rusqlite::Result<Result<SearchDocument, RejectedDocument>> {
        let id: Option<i64> = row.get(0)?;
        let owner_id: Option<i64> = row.get(1)?;
        let original_filename: Option<String> = row.get(2)?;
        let stored_filename: Option<String> = row.get(3)?;
        let storage_path: Option<String> = row.get(4)?;
        let subject: Option<String> = row.get(5)?;
        let category: Option<String> = row.get(6)?;
        let extension: Option<String> = row.get(7)?;
        let size: Option<i64> = row.get(8)?;
        let created_at: Option<String> = row.get(9)?;
        let content: Option<String> = row.get(10)?;

        let reject = |reason: String| -> rusqlite::Result<Result<SearchDocument, RejectedDocument>> {
            Ok(Err(RejectedDocument { id, reason }))
        };

        let Some(id) = id else {
            return reject("missing id".to_string());
        };
        let Some(owner_id) = owner_id else {
            return reject("missing owner id".to_string());
        };
        let original_filename = match original_filename {
            Some(name) if !name.trim().is_empty() => name,
            _ => return reject("missing original filename".to_string()),
        };
        let storage_path = match storage_path {
            Some(path) if !path.trim().is_empty() => path,
            _ => return reject("missing storage path".to_string()),
        };
        let category = match category.as_deref().map(str::parse::<Category>) {
            Some(Ok(category)) => category,
            Some(Err(e)) => return reject(e),
            None => return reject("missing category".to_string()),
        };
        let size = match size.map(u64::try_from) {
            Some(Ok(size)) => size,
            _ => return reject("missing or negative size".to_string()),
        };

        Ok(Ok(SearchDocument {
            id,
            owner_id,
            stored_filename: stored_filename.unwrap_or_else(|| original_filename.clone()),
            original_filename,
            storage_path,
            subject: subject.unwrap_or_default(),
            category,
            extension: extension.unwrap_or_default(),
            size,
            created_at: created_at.unwrap_or_default(),
            content: content.unwrap_or_default(),
        }))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> anyhow::Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl SearchIndex for SqliteSearchIndex {
    fn ping(&self) -> Result<(), IndexError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn index_exists(&self) -> Result<bool, IndexError> {
        Self::exists(&self.conn.lock())
    }

    fn create_index(&self) -> Result<CreateOutcome, IndexError> {
        let conn = self.conn.lock();
        if Self::exists(&conn)? {
            return Ok(CreateOutcome::AlreadyExists);
        }
        conn.execute_batch(
            "CREATE TABLE documents (
                id                  INTEGER PRIMARY KEY,
                owner_id            INTEGER,
                original_filename   TEXT,
                stored_filename     TEXT,
                storage_path        TEXT,
                subject             TEXT,
                category            TEXT,
                extension           TEXT,
                size                INTEGER,
                created_at          TEXT,
                content             TEXT
            );

            CREATE INDEX idx_documents_subject ON documents(subject);
            CREATE INDEX idx_documents_category ON documents(category);

            CREATE VIRTUAL TABLE documents_fts USING fts5(
                original_filename, subject, content,
                content='documents', content_rowid='id'
            );

            CREATE TRIGGER documents_ai AFTER INSERT ON documents BEGIN
                INSERT INTO documents_fts(rowid, original_filename, subject, content)
                VALUES (new.id, new.original_filename, new.subject, new.content);
            END;

            CREATE TRIGGER documents_ad AFTER DELETE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, original_filename, subject, content)
                VALUES ('delete', old.id, old.original_filename, old.subject, old.content);
            END;

            CREATE TRIGGER documents_au AFTER UPDATE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, original_filename, subject, content)
                VALUES ('delete', old.id, old.original_filename, old.subject, old.content);
                INSERT INTO documents_fts(rowid, original_filename, subject, content)
                VALUES (new.id, new.original_filename, new.subject, new.content);
            END;",
        )?;
        info!("created search index");
        Ok(CreateOutcome::Created)
    }

    fn delete_index(&self) -> Result<bool, IndexError> {
        let conn = self.conn.lock();
        if !Self::exists(&conn)? {
            return Ok(false);
        }
        conn.execute_batch(
            "DROP TRIGGER IF EXISTS documents_ai;
             DROP TRIGGER IF EXISTS documents_ad;
             DROP TRIGGER IF EXISTS documents_au;
             DROP TABLE IF EXISTS documents_fts;
             DROP TABLE IF EXISTS documents;",
        )?;
        info!("deleted search index");
        Ok(true)
    }

    fn index_document(&self, doc: &SearchDocument) -> Result<(), IndexError> {
        let conn = self.conn.lock();
        Self::require(&conn)?;
        conn.execute(
            "INSERT INTO documents (id, owner_id, original_filename, stored_filename, storage_path,
             subject, category, extension, size, created_at, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                original_filename = excluded.original_filename,
                stored_filename = excluded.stored_filename,
                storage_path = excluded.storage_path,
                subject = excluded.subject,
                category = excluded.category,
                extension = excluded.extension,
                size = excluded.size,
                created_at = excluded.created_at,
                content = excluded.content",
            params![
                doc.id, doc.owner_id, doc.original_filename, doc.stored_filename,
                doc.storage_path, doc.subject, doc.category.as_str(), doc.extension,
                doc.size, doc.created_at, doc.content,
            ],
        )?;
        debug!(id = doc.id, "indexed document");
        Ok(())
    }

    fn delete_document(&self, id: i64) -> Result<bool, IndexError> {
        let conn = self.conn.lock();
        Self::require(&conn)?;
        let n = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn get_document(&self, id: i64) -> Result<Option<SearchDocument>, IndexError> {
        let conn = self.conn.lock();
        Self::require(&conn)?;
        let row = conn
            .query_row(
                &format!("SELECT {DOC_COLUMNS} FROM documents WHERE id = ?1"),
                params![id],
                Self::row_to_document,
            )
            .optional()?;
        Ok(row.and_then(Result::ok))
    }

    fn get_page(&self, from: usize, size: usize) -> Result<IndexPage, IndexError> {
        let conn = self.conn.lock();
        Self::require(&conn)?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let mut page = IndexPage {
            total: total as usize,
            ..IndexPage::default()
        };

        let size = size.min(self.max_result_window.saturating_sub(from));
        if size == 0 {
            return Ok(page);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {DOC_COLUMNS} FROM documents ORDER BY id ASC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![size as i64, from as i64], Self::row_to_document)?;
        for row in rows {
            page.consumed += 1;
            match row? {
                Ok(doc) => page.documents.push(doc),
                Err(rejected) => page.rejected.push(rejected),
            }
        }
        Ok(page)
    }

    fn stats(&self) -> Result<IndexStats, IndexError> {
        let conn = self.conn.lock();
        Self::require(&conn)?;
        let documents: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
        Ok(IndexStats {
            documents: documents as usize,
            size_bytes: (page_count * page_size) as u64,
        })
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let conn = self.conn.lock();
        Self::require(&conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, documents_fts.rank
             FROM documents_fts
             JOIN documents d ON d.id = documents_fts.rowid
             WHERE documents_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
            DOC_COLUMNS
                .split(',')
                .map(|c| format!("d.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![query, limit as i64], |row| {
                Ok((Self::row_to_document(row)?, row.get::<_, f64>(11)?))
            })
            .map_err(|e| IndexError::InvalidQuery(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let (doc, rank) = row.map_err(|e| IndexError::InvalidQuery(e.to_string()))?;
            if let Ok(document) = doc {
                hits.push(SearchHit { document, rank });
            }
        }
        Ok(hits)
    }

    fn max_result_window(&self) -> usize {
        self.max_result_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: i64, name: &str, content: &str) -> SearchDocument {
        SearchDocument {
            id,
            owner_id: 1,
            original_filename: name.to_string(),
            stored_filename: name.to_string(),
            storage_path: format!("physics/exams/{name}"),
            subject: "Physics".to_string(),
            category: Category::Exam,
            extension: "pdf".to_string(),
            size: 10,
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            content: content.to_string(),
        }
    }

    fn index() -> SqliteSearchIndex {
        let index = SqliteSearchIndex::open_in_memory(DEFAULT_MAX_RESULT_WINDOW).unwrap();
        index.create_index().unwrap();
        index
    }

    #[test]
    fn create_index_is_idempotent() {
        let index = SqliteSearchIndex::open_in_memory(10).unwrap();
        assert!(!index.index_exists().unwrap());
        assert_eq!(index.create_index().unwrap(), CreateOutcome::Created);
        assert_eq!(index.create_index().unwrap(), CreateOutcome::AlreadyExists);
        assert!(index.delete_index().unwrap());
        assert!(!index.delete_index().unwrap());
    }

    #[test]
    fn writes_fail_without_an_index() {
        let index = SqliteSearchIndex::open_in_memory(10).unwrap();
        let err = index.index_document(&doc(1, "a.pdf", "")).unwrap_err();
        assert!(matches!(err, IndexError::Missing));
    }

    #[test]
    fn index_document_upserts_and_searches() {
        let index = index();
        index.index_document(&doc(1, "waves.pdf", "standing waves on a string")).unwrap();
        index.index_document(&doc(1, "waves.pdf", "interference patterns")).unwrap();

        assert_eq!(index.stats().unwrap().documents, 1);
        assert!(index.search("standing", 10).unwrap().is_empty());
        let hits = index.search("interference", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, 1);
    }

    #[test]
    fn delete_document_reports_presence() {
        let index = index();
        index.index_document(&doc(5, "x.pdf", "")).unwrap();
        assert!(index.delete_document(5).unwrap());
        assert!(!index.delete_document(5).unwrap());
        assert!(index.get_document(5).unwrap().is_none());
    }

    #[test]
    fn pages_are_bounded_by_the_result_window() {
        let index = SqliteSearchIndex::open_in_memory(5).unwrap();
        index.create_index().unwrap();
        for id in 1..=8 {
            index.index_document(&doc(id, &format!("{id}.pdf"), "")).unwrap();
        }

        let first = index.get_page(0, 3).unwrap();
        assert_eq!(first.documents.len(), 3);
        assert_eq!(first.total, 8);
        let second = index.get_page(3, 3).unwrap();
        assert_eq!(second.documents.len(), 2);
        let beyond = index.get_page(5, 3).unwrap();
        assert!(beyond.documents.is_empty());
    }

    #[test]
    fn malformed_rows_are_rejected_not_returned() {
        let index = index();
        index.index_document(&doc(1, "ok.pdf", "")).unwrap();
        index
            .execute_batch(
                "INSERT INTO documents (id, owner_id, original_filename, storage_path, category, size)
                 VALUES (2, 1, 'bad.pdf', 'x/y/bad.pdf', 'slides', 3);
                 INSERT INTO documents (id, owner_id, original_filename, storage_path, category, size)
                 VALUES (3, 1, '', 'x/y/z.pdf', 'exam', 3);",
            )
            .unwrap();

        let page = index.get_page(0, 10).unwrap();
        assert_eq!(page.documents.len(), 1);
        assert_eq!(page.rejected.len(), 2);
        assert_eq!(page.consumed, 3);
        assert_eq!(page.rejected[0].id, Some(2));
    }
}
