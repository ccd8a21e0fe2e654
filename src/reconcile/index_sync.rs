//! Disaster recovery: search index → catalog.

use super::{ItemPlan, JobKind, JobOptions, JobReport, ReconcileError, Reconciler};
use crate::vault::identity::{IdentityResolver, Resolution};
use crate::vault::schema::{NewFileRecord, ProcessingStatus, SearchDocument};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What [`Reconciler::auto_restore`] did.
#[derive(Debug)]
pub enum RestoreOutcome {
    /// The catalog already has records.
    NotNeeded { records: usize },
    /// The catalog is empty but there is no index to restore from.
    IndexUnavailable(String),
    Restored(JobReport),
}

impl Reconciler {
    fn require_index(&self) -> Result<()> {
        self.index
            .ping()
            .map_err(|e| ReconcileError::IndexUnavailable(e.to_string()))?;
        match self.index.index_exists() {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReconcileError::IndexUnavailable("the index does not exist".into()).into()),
            Err(e) => Err(ReconcileError::IndexUnavailable(e.to_string()).into()),
        }
    }

    /// Recreates catalog records from index documents, keeping their ids.
    ///
    /// `opts.owner_id` is the fallback owner for documents whose owner no
    /// longer exists. Records whose blob is missing are restored as failed.
    pub async fn sync_from_index(&self, opts: &JobOptions) -> Result<JobReport> {
        self.require_index()?;
        let fallback = self.require_owner(opts)?;
        let mut report = self.new_report(JobKind::SyncFromIndex, opts);

        let mut resolver = IdentityResolver::new(&self.catalog, &self.blobs);
        let mut known_owners: HashMap<i64, bool> = HashMap::new();
        let page_size = self.settings.page_size.max(1);
        let mut from = 0;
        let mut indexed = 0;

        'pages: loop {
            let page = match self.index.get_page(from, page_size) {
                Ok(page) => page,
                Err(e) => {
                    let e = anyhow::Error::new(e).context(format!("Failed to read index page at offset {from}"));
                    warn!(from, error = %format!("{e:#}"), "stopping index read");
                    report.record_failure(format!("index page {from}"), &e);
                    break;
                }
            };
            indexed = page.total;
            if page.consumed == 0 {
                break;
            }
            from += page.consumed;

            for rejected in page.rejected {
                report.total += 1;
                let item = match rejected.id {
                    Some(id) => format!("document {id}"),
                    None => "document without id".to_string(),
                };
                warn!(%item, reason = %rejected.reason, "rejected malformed index document");
                report.record_failure(item, &anyhow::anyhow!(rejected.reason));
            }

            for doc in page.documents {
                if self.cancelled(&mut report) || Self::limit_reached(opts, &mut report) {
                    break 'pages;
                }
                report.total += 1;
                self.progress(&report);
                let item = format!("document {} ({})", doc.id, doc.original_filename);

                match resolver.resolve_file_id(doc.id) {
                    Ok(Resolution::New) => {}
                    Ok(_) => {
                        debug!(id = doc.id, "already in the catalog");
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(id = doc.id, error = %e, "identity lookup failed");
                        report.record_failure(item, &e);
                        continue;
                    }
                }

                let owner_id = match self.owner_or_fallback(&mut known_owners, doc.owner_id) {
                    Ok(true) => doc.owner_id,
                    Ok(false) => {
                        debug!(id = doc.id, owner_id = doc.owner_id, "owner missing, using default owner");
                        report.owner_fallbacks += 1;
                        fallback.id
                    }
                    Err(e) => {
                        report.record_failure(item, &e);
                        continue;
                    }
                };

                if opts.dry_run {
                    report.planned += 1;
                    continue;
                }

                let status = if self.blobs.exists(&doc.storage_path).await {
                    ProcessingStatus::Completed
                } else {
                    warn!(id = doc.id, storage_path = %doc.storage_path, "blob missing, restoring as failed");
                    ProcessingStatus::Failed
                };
                let mut record = restored_record(&doc, owner_id, status);
                if record.created_at.is_none() {
                    record.created_at = self.blob_modified_at(&doc.storage_path).await;
                }
                let plan = ItemPlan {
                    record,
                    blob_source: None,
                    index_content: None,
                    restore: true,
                };
                match self.apply(plan, &mut report).await {
                    Ok(saved) => {
                        debug!(id = saved.id, "restored record");
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        warn!(id = doc.id, error = %format!("{e:#}"), "restore failed");
                        report.record_failure(item, &e);
                    }
                }
            }
        }

        if report.stopped.is_none() && indexed > from {
            report.unreachable = indexed - from;
            warn!(
                unreachable = report.unreachable,
                window = self.index.max_result_window(),
                "documents beyond the index result window were not restored"
            );
        }

        Ok(self.finish(report))
    }

    /// Modification time of a blob, for records whose creation time was
    /// lost. `None` lets the catalog stamp the current time.
    async fn blob_modified_at(&self, storage_path: &str) -> Option<String> {
        let meta = tokio::fs::metadata(self.blobs.resolve(storage_path)).await.ok()?;
        let modified = meta.modified().ok()?;
        Some(DateTime::<Utc>::from(modified).to_rfc3339())
    }

    fn owner_or_fallback(&self, cache: &mut HashMap<i64, bool>, owner_id: i64) -> Result<bool> {
        if let Some(&exists) = cache.get(&owner_id) {
            return Ok(exists);
        }
        let exists = self.catalog.owner_exists(owner_id)?;
        cache.insert(owner_id, exists);
        Ok(exists)
    }

    /// Startup guard. When the catalog has no file records, makes sure the
    /// default owner exists and restores from the index.
    pub async fn auto_restore(&self, default_username: &str) -> Result<RestoreOutcome> {
        let records = self.catalog.count_files()?;
        if records > 0 {
            debug!(records, "catalog populated, nothing to restore");
            return Ok(RestoreOutcome::NotNeeded { records });
        }
        if let Err(e) = self.require_index() {
            warn!(error = %e, "catalog is empty and the search index is unavailable");
            return Ok(RestoreOutcome::IndexUnavailable(e.to_string()));
        }

        info!(default_username, "catalog is empty, restoring from the search index");
        let owner = self.catalog.ensure_owner(default_username, true)?;
        let opts = JobOptions {
            owner_id: Some(owner.id),
            ..JobOptions::default()
        };
        let report = self.sync_from_index(&opts).await?;
        Ok(RestoreOutcome::Restored(report))
    }
}

fn restored_record(doc: &SearchDocument, owner_id: i64, status: ProcessingStatus) -> NewFileRecord {
    NewFileRecord {
        id: Some(doc.id),
        owner_id,
        original_filename: doc.original_filename.clone(),
        stored_filename: doc.stored_filename.clone(),
        storage_path: doc.storage_path.clone(),
        subject: doc.subject.clone(),
        category: doc.category,
        size: doc.size,
        extension: doc.extension.clone(),
        status,
        created_at: Some(doc.created_at.trim())
            .filter(|created| !created.is_empty())
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{BrokenIndex, Fixture};
    use super::super::StopReason;
    use super::*;
    use crate::config::Config;
    use crate::vault::catalog::Catalog;
    use crate::vault::schema::Category;
    use crate::vault::search::{SearchIndex, SqliteSearchIndex};
    use crate::vault::storage::BlobStore;
    use std::sync::Arc;

    fn document(id: i64, owner_id: i64, storage_path: &str) -> SearchDocument {
        SearchDocument {
            id,
            owner_id,
            original_filename: format!("notes-{id}.txt"),
            stored_filename: format!("notes-{id}_0123456789ab.txt"),
            storage_path: storage_path.to_string(),
            subject: "Statistics".to_string(),
            category: Category::LectureNotes,
            extension: "txt".to_string(),
            size: 10,
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            content: "variance".to_string(),
        }
    }

    #[tokio::test]
    async fn restores_ids_and_falls_back_to_the_default_owner() {
        let fx = Fixture::new();
        fx.index.create_index().unwrap();
        fx.index.index_document(&document(5, fx.owner.id, "statistics/lecture-notes/a.txt")).unwrap();
        fx.index.index_document(&document(9, 777, "statistics/lecture-notes/b.txt")).unwrap();

        let report = fx.reconciler.sync_from_index(&fx.opts()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.owner_fallbacks, 1);

        let orphan = fx.reconciler.catalog().find_by_id(9).unwrap().unwrap();
        assert_eq!(orphan.owner_id, fx.owner.id);
        // no blobs were ever written
        assert_eq!(orphan.status, ProcessingStatus::Failed);
        assert_eq!(orphan.created_at, "2024-01-01T00:00:00+00:00");

        let again = fx.reconciler.sync_from_index(&fx.opts()).await.unwrap();
        assert_eq!(again.skipped, 2);
        assert_eq!(fx.reconciler.catalog().count_files().unwrap(), 2);
    }

    #[tokio::test]
    async fn restored_records_with_blobs_are_completed() {
        let fx = Fixture::new();
        fx.touch("Statistics/Lecture Notes/a.txt", b"variance");
        fx.reconciler.migrate(&fx.opts()).await.unwrap();
        let migrated = fx.reconciler.catalog().records_after(0, 1).unwrap().remove(0);
        fx.reconciler.catalog().wipe().unwrap();

        let report = fx.reconciler.sync_from_index(&fx.opts()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let restored = fx.reconciler.catalog().find_by_id(migrated.id).unwrap().unwrap();
        assert_eq!(restored.status, ProcessingStatus::Completed);
        assert_eq!(restored.storage_path, migrated.storage_path);
    }

    #[tokio::test]
    async fn documents_beyond_the_window_are_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let owner = catalog.ensure_owner("admin", true).unwrap();
        let index = Arc::new(SqliteSearchIndex::open_in_memory(3).unwrap());
        index.create_index().unwrap();
        for id in 1..=5 {
            index.index_document(&document(id, owner.id, "x/y/z.txt")).unwrap();
        }
        let mut config = Config::default();
        config.search.page_size = 2;
        let reconciler = Reconciler::new(catalog, BlobStore::from_path(tmp.path()), index)
            .with_settings((&config).into());

        let opts = JobOptions {
            owner_id: Some(owner.id),
            ..JobOptions::default()
        };
        let report = reconciler.sync_from_index(&opts).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.unreachable, 2);
    }

    #[tokio::test]
    async fn limit_applies_to_restored_documents() {
        let fx = Fixture::new();
        fx.index.create_index().unwrap();
        for id in 1..=4 {
            fx.index.index_document(&document(id, fx.owner.id, "x/y/z.txt")).unwrap();
        }
        let mut opts = fx.opts();
        opts.limit = Some(3);
        let report = fx.reconciler.sync_from_index(&opts).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.stopped, Some(StopReason::Limit(3)));
    }

    #[tokio::test]
    async fn auto_restore_only_runs_on_an_empty_catalog() {
        let fx = Fixture::new();
        fx.index.create_index().unwrap();
        fx.index.index_document(&document(1, 555, "x/y/z.txt")).unwrap();

        let outcome = fx.reconciler.auto_restore("registrar").await.unwrap();
        let RestoreOutcome::Restored(report) = outcome else {
            panic!("expected a restore, got {outcome:?}");
        };
        assert_eq!(report.succeeded, 1);
        let registrar = fx
            .reconciler
            .catalog()
            .find_owner_by_username("registrar")
            .unwrap()
            .unwrap();
        let record = fx.reconciler.catalog().find_by_id(1).unwrap().unwrap();
        assert_eq!(record.owner_id, registrar.id);

        let outcome = fx.reconciler.auto_restore("registrar").await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::NotNeeded { records: 1 }));
    }

    #[tokio::test]
    async fn auto_restore_without_an_index() {
        let mut fx = Fixture::new();
        let outcome = fx.reconciler.auto_restore("admin").await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::IndexUnavailable(_)));

        fx.use_index(Arc::new(BrokenIndex));
        let outcome = fx.reconciler.auto_restore("admin").await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_creation_times_fall_back_to_the_blob_or_now() {
        let fx = Fixture::new();
        fx.touch("Statistics/Lecture Notes/a.txt", b"variance");
        fx.reconciler.migrate(&fx.opts()).await.unwrap();
        let migrated = fx.reconciler.catalog().records_after(0, 1).unwrap().remove(0);
        fx.reconciler.catalog().wipe().unwrap();

        let mut with_blob = fx.index.get_document(migrated.id).unwrap().unwrap();
        with_blob.created_at = String::new();
        fx.index.index_document(&with_blob).unwrap();
        let mut without_blob = document(50, fx.owner.id, "statistics/lecture-notes/gone.txt");
        without_blob.created_at = String::new();
        fx.index.index_document(&without_blob).unwrap();

        let report = fx.reconciler.sync_from_index(&fx.opts()).await.unwrap();
        assert_eq!(report.succeeded, 2);

        let blob_path = fx.reconciler.blobs().resolve(&migrated.storage_path);
        let modified: DateTime<Utc> = std::fs::metadata(blob_path).unwrap().modified().unwrap().into();
        let restored = fx.reconciler.catalog().find_by_id(migrated.id).unwrap().unwrap();
        assert_eq!(restored.created_at, modified.to_rfc3339());

        let restored = fx.reconciler.catalog().find_by_id(50).unwrap().unwrap();
        assert!(DateTime::parse_from_rfc3339(&restored.created_at).is_ok());
    }

    #[tokio::test]
    async fn dry_runs_restore_nothing() {
        let fx = Fixture::new();
        fx.index.create_index().unwrap();
        fx.index.index_document(&document(1, fx.owner.id, "x/y/z.txt")).unwrap();
        let mut opts = fx.opts();
        opts.dry_run = true;

        let report = fx.reconciler.sync_from_index(&opts).await.unwrap();
        assert_eq!(report.planned, 1);
        assert_eq!(fx.reconciler.catalog().count_files().unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_documents_count_as_failures() {
        let fx = Fixture::new();
        fx.index.create_index().unwrap();
        fx.index.index_document(&document(1, fx.owner.id, "x/y/z.txt")).unwrap();
        fx.index
            .execute_batch(
                "INSERT INTO documents (id, owner_id, original_filename, category, size)
                 VALUES (2, 1, 'broken.txt', 'poetry', 3)",
            )
            .unwrap();

        let report = fx.reconciler.sync_from_index(&fx.opts()).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }
}
