use super::schema::{Category, FileRecord, NewFileRecord, Owner, ProcessingStatus};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const FILE_COLUMNS: &str = "id, owner_id, original_filename, stored_filename, storage_path,
     subject, category, size, extension, status, created_at, updated_at";

/// SQLite-backed catalog of file records and their owners.
///
/// This is the authoritative store. Blobs and search documents are
/// reconciled against it.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

/// Row counts removed by [`Catalog::wipe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WipeSummary {
    pub files: usize,
    pub favorites: usize,
}

impl Catalog {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open catalog at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Opens an existing catalog without creating, migrating or writing
    /// anything. Every write through this handle fails.
    pub fn open_read_only(db_path: &Path) -> Result<Self> {
        if !db_path.is_file() {
            bail!("catalog {} does not exist", db_path.display());
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open catalog at {} read-only", db_path.display()))?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS owners (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL UNIQUE,
                is_staff    INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id            INTEGER NOT NULL REFERENCES owners(id),
                original_filename   TEXT NOT NULL,
                stored_filename     TEXT NOT NULL,
                storage_path        TEXT NOT NULL,
                subject             TEXT NOT NULL,
                category            TEXT NOT NULL,
                size                INTEGER NOT NULL,
                extension           TEXT NOT NULL,
                status              TEXT NOT NULL,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS favorites (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id    INTEGER NOT NULL REFERENCES owners(id),
                file_id     INTEGER NOT NULL REFERENCES files(id),
                created_at  TEXT NOT NULL,
                UNIQUE (owner_id, file_id)
            );

            CREATE INDEX IF NOT EXISTS idx_files_storage_path ON files(storage_path);
            CREATE INDEX IF NOT EXISTS idx_files_identity ON files(subject, original_filename, category);
            CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner_id);",
        )
        .context("Failed to init catalog schema")?;
        Ok(())
    }

    // ── owners ────────────────────────────────────────────────────

    /// Returns the owner with this username, creating it if needed.
    pub fn ensure_owner(&self, username: &str, is_staff: bool) -> Result<Owner> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO owners (username, is_staff, created_at) VALUES (?1, ?2, ?3)",
                params![username, is_staff, Utc::now().to_rfc3339()],
            )
            .context("Failed to ensure owner")?;
        if inserted > 0 {
            info!(username, "created owner");
        }
        conn.query_row(
            "SELECT id, username, is_staff, created_at FROM owners WHERE username = ?1",
            params![username],
            Self::row_to_owner,
        )
        .context("Failed to read owner back")
    }

    pub fn find_owner(&self, id: i64) -> Result<Option<Owner>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, is_staff, created_at FROM owners WHERE id = ?1",
            params![id],
            Self::row_to_owner,
        )
        .optional()
        .context("Failed to look up owner")
    }

    pub fn find_owner_by_username(&self, username: &str) -> Result<Option<Owner>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, is_staff, created_at FROM owners WHERE username = ?1",
            params![username],
            Self::row_to_owner,
        )
        .optional()
        .context("Failed to look up owner")
    }

    pub fn owner_exists(&self, id: i64) -> Result<bool> {
        Ok(self.find_owner(id)?.is_some())
    }

    pub fn count_owners(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM owners", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // ── file records ──────────────────────────────────────────────

    /// Inserts or updates one record inside a single transaction.
    ///
    /// A record whose `id` already exists is updated in place (keeping its
    /// `created_at`); otherwise a row is inserted, using the given `id` when
    /// there is one. Any failure rolls the transaction back and is returned.
    pub fn create_or_update(&self, record: &NewFileRecord) -> Result<FileRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();

        let existing = match record.id {
            Some(id) => tx
                .query_row("SELECT 1 FROM files WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?
                .is_some(),
            None => false,
        };

        let id = if existing {
            let id = record.id.unwrap_or_default();
            tx.execute(
                "UPDATE files SET owner_id = ?1, original_filename = ?2, stored_filename = ?3,
                 storage_path = ?4, subject = ?5, category = ?6, size = ?7, extension = ?8,
                 status = ?9, updated_at = ?10
                 WHERE id = ?11",
                params![
                    record.owner_id, record.original_filename, record.stored_filename,
                    record.storage_path, record.subject, record.category.as_str(),
                    record.size, record.extension, record.status.as_str(), now, id,
                ],
            )
            .context("Failed to update file record")?;
            debug!(id, storage_path = %record.storage_path, "updated file record");
            id
        } else {
            let created_at = record.created_at.clone().unwrap_or_else(|| now.clone());
            tx.execute(
                "INSERT INTO files (id, owner_id, original_filename, stored_filename, storage_path,
                 subject, category, size, extension, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id, record.owner_id, record.original_filename, record.stored_filename,
                    record.storage_path, record.subject, record.category.as_str(), record.size,
                    record.extension, record.status.as_str(), created_at, now,
                ],
            )
            .context("Failed to insert file record")?;
            let id = tx.last_insert_rowid();
            debug!(id, storage_path = %record.storage_path, "inserted file record");
            id
        };

        let saved = tx
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                Self::row_to_record,
            )
            .context("Failed to read file record back")?;
        tx.commit().context("Failed to commit file record")?;
        Ok(saved)
    }

    /// Inserts a record recovered from elsewhere under its original id.
    /// Fails if the id is missing or already taken.
    pub fn insert_restored(&self, record: &NewFileRecord) -> Result<FileRecord> {
        let Some(id) = record.id else {
            bail!("restored record for {} has no id", record.original_filename);
        };
        if self.find_by_id(id)?.is_some() {
            bail!("file record {id} already exists");
        }
        self.create_or_update(record)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        self.find_one("id = ?1", params![id])
    }

    /// Exact storage-path match; lowest id wins when several rows share it.
    pub fn find_by_storage_path(&self, storage_path: &str) -> Result<Option<FileRecord>> {
        self.find_one("storage_path = ?1", params![storage_path])
    }

    /// `(subject, original filename, category)` match; lowest id wins.
    pub fn find_by_identity(
        &self,
        subject: &str,
        original_filename: &str,
        category: Category,
    ) -> Result<Option<FileRecord>> {
        self.find_one(
            "subject = ?1 AND original_filename = ?2 AND category = ?3",
            params![subject, original_filename, category.as_str()],
        )
    }

    fn find_one(&self, where_sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE {where_sql} ORDER BY id ASC LIMIT 1");
        conn.query_row(&sql, params, Self::row_to_record)
            .optional()
            .context("Failed to look up file record")
    }

    pub fn count_files(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Keyset page of records with `id > after`, in id order.
    pub fn records_after(&self, after: i64, limit: usize) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![after, limit as i64], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to page file records")
    }

    pub fn add_favorite(&self, owner_id: i64, file_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO favorites (owner_id, file_id, created_at) VALUES (?1, ?2, ?3)",
            params![owner_id, file_id, Utc::now().to_rfc3339()],
        )
        .context("Failed to add favorite")?;
        Ok(())
    }

    pub fn count_favorites(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM favorites", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Removes every file record and favorite. Owners are kept.
    ///
    /// Foreign keys stay enforced but are checked at commit instead of per
    /// statement, so the delete order does not matter.
    pub fn wipe(&self) -> Result<WipeSummary> {
        let mut conn = self.conn.lock();
        let enforced: i64 = conn.pragma_query_value(None, "foreign_keys", |row| row.get(0))?;
        let tx = conn.transaction().context("Failed to begin wipe")?;
        if enforced != 0 {
            tx.pragma_update(None, "defer_foreign_keys", true)?;
        }

        let files = tx.execute("DELETE FROM files", [])?;
        let favorites = tx.execute("DELETE FROM favorites", [])?;
        tx.execute(
            "DELETE FROM sqlite_sequence WHERE name IN ('files', 'favorites')",
            [],
        )?;
        tx.commit().context("Failed to commit wipe")?;

        info!(files, favorites, "wiped catalog");
        Ok(WipeSummary { files, favorites })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn row_to_owner(row: &Row) -> rusqlite::Result<Owner> {
        Ok(Owner {
            id: row.get(0)?,
            username: row.get(1)?,
            is_staff: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<FileRecord> {
        Ok(FileRecord {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            original_filename: row.get(2)?,
            stored_filename: row.get(3)?,
            storage_path: row.get(4)?,
            subject: row.get(5)?,
            category: parse_column::<Category>(row, 6)?,
            size: row.get::<_, i64>(7)? as u64,
            extension: row.get(8)?,
            status: parse_column::<ProcessingStatus>(row, 9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(owner_id: i64, subject: &str, name: &str, path: &str) -> NewFileRecord {
        NewFileRecord {
            id: None,
            owner_id,
            original_filename: name.to_string(),
            stored_filename: name.to_string(),
            storage_path: path.to_string(),
            subject: subject.to_string(),
            category: Category::Exam,
            size: 42,
            extension: "pdf".to_string(),
            status: ProcessingStatus::Completed,
            created_at: None,
        }
    }

    #[test]
    fn ensure_owner_is_idempotent() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog.ensure_owner("admin", true).unwrap();
        let b = catalog.ensure_owner("admin", false).unwrap();
        assert_eq!(a.id, b.id);
        assert!(b.is_staff);
        assert_eq!(catalog.count_owners().unwrap(), 1);
    }

    #[test]
    fn create_then_update_in_place() {
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        let created = catalog
            .create_or_update(&sample(owner.id, "Calculus", "final.pdf", "/legacy/final.pdf"))
            .unwrap();

        let mut relocated = sample(owner.id, "Calculus", "final.pdf", "calculus/exams/final_abc.pdf");
        relocated.id = Some(created.id);
        let updated = catalog.create_or_update(&relocated).unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.storage_path, "calculus/exams/final_abc.pdf");
        assert_eq!(catalog.count_files().unwrap(), 1);
    }

    #[test]
    fn explicit_ids_are_preserved_on_insert() {
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        let mut restored = sample(owner.id, "Physics", "waves.pdf", "physics/exams/waves.pdf");
        restored.id = Some(77);
        let saved = catalog.create_or_update(&restored).unwrap();
        assert_eq!(saved.id, 77);
        assert!(catalog.find_by_id(77).unwrap().is_some());
    }

    #[test]
    fn read_only_catalogs_must_exist_and_reject_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("catalog.db");
        assert!(Catalog::open_read_only(&path).is_err());
        assert!(!path.exists());

        let writable = Catalog::open(&path).unwrap();
        writable.ensure_owner("admin", true).unwrap();

        let read_only = Catalog::open_read_only(&path).unwrap();
        assert!(read_only.find_owner_by_username("admin").unwrap().is_some());
        assert!(read_only.ensure_owner("someone", false).is_err());
        assert_eq!(writable.count_owners().unwrap(), 1);
    }

    #[test]
    fn insert_restored_needs_a_free_id() {
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        assert!(catalog
            .insert_restored(&sample(owner.id, "Physics", "waves.pdf", "physics/exams/waves.pdf"))
            .is_err());

        let mut restored = sample(owner.id, "Physics", "waves.pdf", "physics/exams/waves.pdf");
        restored.id = Some(12);
        assert_eq!(catalog.insert_restored(&restored).unwrap().id, 12);
        assert!(catalog.insert_restored(&restored).is_err());
        assert!(catalog.find_owner_by_username("admin").unwrap().is_some());
        assert!(catalog.find_owner_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn identity_lookup_prefers_lowest_id() {
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        let first = catalog
            .create_or_update(&sample(owner.id, "Chem", "lab.pdf", "/a/lab.pdf"))
            .unwrap();
        catalog
            .create_or_update(&sample(owner.id, "Chem", "lab.pdf", "/b/lab.pdf"))
            .unwrap();

        let found = catalog
            .find_by_identity("Chem", "lab.pdf", Category::Exam)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert!(catalog
            .find_by_identity("Chem", "lab.pdf", Category::Other)
            .unwrap()
            .is_none());
    }

    #[test]
    fn failed_transactions_leave_no_rows() {
        let catalog = Catalog::open_in_memory().unwrap();
        // owner 999 does not exist, so the foreign key rejects the insert
        let err = catalog.create_or_update(&sample(999, "Chem", "lab.pdf", "/a/lab.pdf"));
        assert!(err.is_err());
        assert_eq!(catalog.count_files().unwrap(), 0);
    }

    #[test]
    fn wipe_clears_files_and_favorites_but_keeps_owners() {
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        let file = catalog
            .create_or_update(&sample(owner.id, "Chem", "lab.pdf", "/a/lab.pdf"))
            .unwrap();
        catalog.add_favorite(owner.id, file.id).unwrap();

        let summary = catalog.wipe().unwrap();
        assert_eq!(summary, WipeSummary { files: 1, favorites: 1 });
        assert_eq!(catalog.count_files().unwrap(), 0);
        assert_eq!(catalog.count_favorites().unwrap(), 0);
        assert_eq!(catalog.count_owners().unwrap(), 1);
    }

    #[test]
    fn records_after_pages_in_id_order() {
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        for i in 0..5 {
            catalog
                .create_or_update(&sample(owner.id, "Art", &format!("{i}.pdf"), &format!("/x/{i}.pdf")))
                .unwrap();
        }
        let first = catalog.records_after(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = catalog.records_after(first[1].id, 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest[0].id > first[1].id);
    }
}
