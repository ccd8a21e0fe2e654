//! Reconciliation jobs between the blob store, the catalog and the
//! search index.
//!
//! Every job follows the same shape: scan a source store, resolve each
//! item's identity, then for each new or stale item extract text, write the
//! blob, commit the catalog record and (best-effort) index it. Jobs differ
//! in their source store and dedup key. Items fail individually; only
//! precondition failures abort a job.

pub mod import;
pub mod index_sync;
pub mod migrate;
pub mod reindex;
pub mod report;
pub mod saga;
pub mod storage_sync;

pub use index_sync::RestoreOutcome;
pub use report::{ItemError, JobKind, JobReport, StopReason};

use crate::config::Config;
use crate::vault::catalog::Catalog;
use crate::vault::extract::ContentExtractor;
use crate::vault::scan::SkipReason;
use crate::vault::schema::{FileRecord, NewFileRecord, Owner, SearchDocument};
use crate::vault::search::{CreateOutcome, SearchIndex, SqliteSearchIndex};
use crate::vault::storage::BlobStore;
use anyhow::{Context, Result};
use saga::{Compensation, Saga};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failures that stop a job before it writes anything.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("a source directory is required")]
    MissingSource,
    #[error("source {0} does not exist or is not a directory")]
    InvalidSource(PathBuf),
    #[error("an owner id is required")]
    MissingOwner,
    #[error("owner {0} does not exist")]
    UnknownOwner(i64),
    #[error("owner '{0}' does not exist; create it with `coursevault owner ensure {0}`")]
    UnknownOwnerName(String),
    #[error("{0} was not confirmed")]
    NotConfirmed(String),
    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),
}

/// Asks the operator before destructive steps.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Confirms everything. For non-interactive callers that already checked.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Declines everything.
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Operator-supplied knobs shared by all jobs. Jobs ignore flags that do
/// not apply to them.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub source: Option<PathBuf>,
    pub owner_id: Option<i64>,
    /// Scan and resolve only; write nothing.
    pub dry_run: bool,
    /// Stop after this many items were written (or planned).
    pub limit: Option<usize>,
    pub skip_duplicates: bool,
    pub clear_all: bool,
    pub force: bool,
    pub reextract: bool,
    pub recreate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub error_report_limit: usize,
    pub progress_every: usize,
    pub page_size: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            error_report_limit: 10,
            progress_every: 100,
            page_size: 500,
        }
    }
}

impl From<&Config> for JobSettings {
    fn from(config: &Config) -> Self {
        Self {
            error_report_limit: config.jobs.error_report_limit,
            progress_every: config.jobs.progress_every,
            page_size: config.search.page_size,
        }
    }
}

/// One unit of work: the catalog record to commit, an optional blob to
/// copy into `record.storage_path` first, and the text to index afterwards
/// (`None` skips indexing). `restore` inserts under the record's own id.
pub(crate) struct ItemPlan {
    pub record: NewFileRecord,
    pub blob_source: Option<PathBuf>,
    pub index_content: Option<String>,
    pub restore: bool,
}

pub struct Reconciler {
    catalog: Catalog,
    blobs: BlobStore,
    index: Arc<dyn SearchIndex>,
    extractor: ContentExtractor,
    settings: JobSettings,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(catalog: Catalog, blobs: BlobStore, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            catalog,
            blobs,
            index,
            extractor: ContentExtractor::default(),
            settings: JobSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Opens every store named in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let catalog = Catalog::open(&config.database_path())?;
        let blobs = BlobStore::from_path(config.uploads_dir());
        let index = SqliteSearchIndex::open(&config.search_path(), config.search.max_result_window)?;
        Ok(Self::new(catalog, blobs, Arc::new(index))
            .with_extractor(ContentExtractor::new(config.extraction.max_text_bytes))
            .with_settings(JobSettings::from(config)))
    }

    /// Opens the stores named in `config` for a dry run. The catalog must
    /// already exist; a missing search index is replaced by an empty
    /// in-memory one. Nothing on disk is created or changed.
    pub fn from_config_read_only(config: &Config) -> Result<Self> {
        let catalog = Catalog::open_read_only(&config.database_path())?;
        let blobs = BlobStore::from_path(config.uploads_dir());
        let search_path = config.search_path();
        let window = config.search.max_result_window;
        let index = if search_path.is_file() {
            SqliteSearchIndex::open_read_only(&search_path, window)?
        } else {
            debug!(path = %search_path.display(), "no search index on disk, using an empty one");
            SqliteSearchIndex::open_in_memory(window)?
        };
        Ok(Self::new(catalog, blobs, Arc::new(index))
            .with_extractor(ContentExtractor::new(config.extraction.max_text_bytes))
            .with_settings(JobSettings::from(config)))
    }

    pub fn with_extractor(mut self, extractor: ContentExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn index(&self) -> &dyn SearchIndex {
        self.index.as_ref()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn new_report(&self, job: JobKind, opts: &JobOptions) -> JobReport {
        info!(job = %job, dry_run = opts.dry_run, limit = ?opts.limit, "starting job");
        JobReport::new(job, opts.dry_run, self.settings.error_report_limit)
    }

    fn finish(&self, report: JobReport) -> JobReport {
        let report = report.finish();
        info!(
            job = %report.job,
            total = report.total,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            planned = report.planned,
            "job finished"
        );
        report
    }

    // ── preconditions ─────────────────────────────────────────────

    fn require_dir(path: &Path) -> Result<()> {
        if path.is_dir() {
            Ok(())
        } else {
            Err(ReconcileError::InvalidSource(path.to_path_buf()).into())
        }
    }

    fn require_source(&self, opts: &JobOptions) -> Result<PathBuf> {
        let source = opts.source.clone().ok_or(ReconcileError::MissingSource)?;
        Self::require_dir(&source)?;
        // Absolute paths are what import records store and match on.
        let source = std::fs::canonicalize(&source)
            .with_context(|| format!("Failed to resolve {}", source.display()))?;
        Ok(source)
    }

    fn require_owner(&self, opts: &JobOptions) -> Result<Owner> {
        let id = opts.owner_id.ok_or(ReconcileError::MissingOwner)?;
        self.catalog
            .find_owner(id)?
            .ok_or_else(|| ReconcileError::UnknownOwner(id).into())
    }

    /// Destructive steps need `force` or an explicit yes. Dry runs never ask.
    fn confirm_destructive(&self, gate: &dyn Confirm, opts: &JobOptions, what: &str) -> Result<()> {
        if opts.force || opts.dry_run {
            return Ok(());
        }
        if gate.confirm(what)? {
            Ok(())
        } else {
            Err(ReconcileError::NotConfirmed(what.to_string()).into())
        }
    }

    /// Creates the index if it is missing. Failures only warn: items will
    /// then be stored without being indexed.
    fn ensure_index(&self) {
        match self.index.create_index() {
            Ok(CreateOutcome::Created) => info!("search index was missing and has been created"),
            Ok(CreateOutcome::AlreadyExists) => {}
            Err(e) => warn!(error = %e, "search index unavailable; documents will not be indexed"),
        }
    }

    // ── loop control ──────────────────────────────────────────────

    fn cancelled(&self, report: &mut JobReport) -> bool {
        if self.cancel.is_cancelled() {
            warn!(job = %report.job, "job interrupted");
            report.stopped = Some(StopReason::Cancelled);
            return true;
        }
        false
    }

    fn limit_reached(opts: &JobOptions, report: &mut JobReport) -> bool {
        match opts.limit {
            Some(limit) if report.processed() >= limit => {
                info!(job = %report.job, limit, "item limit reached");
                report.stopped = Some(StopReason::Limit(limit));
                true
            }
            _ => false,
        }
    }

    fn progress(&self, report: &JobReport) {
        let every = self.settings.progress_every;
        if every > 0 && report.total > 0 && report.total % every == 0 {
            info!(
                job = %report.job,
                seen = report.total,
                succeeded = report.succeeded,
                skipped = report.skipped,
                failed = report.failed,
                "progress"
            );
        }
    }

    fn note_skip(report: &mut JobReport, path: &Path, reason: &SkipReason) {
        match reason {
            SkipReason::Hidden => {
                report.hidden += 1;
                debug!(path = %path.display(), "skipping hidden entry");
            }
            SkipReason::Shallow => {
                report.invalid_structure += 1;
                warn!(path = %path.display(), "skipping file outside a subject/category directory");
            }
            SkipReason::UnsafeName => {
                report.invalid_structure += 1;
                warn!(path = %path.display(), "skipping file with an unsafe name; try migrate-remaining");
            }
            SkipReason::NotRegular => {
                report.not_regular += 1;
                debug!(path = %path.display(), "skipping non-regular entry");
            }
            SkipReason::Unreadable(cause) => {
                report.unreadable += 1;
                warn!(path = %path.display(), %cause, "skipping unreadable entry");
            }
        }
    }

    // ── per-item pipeline ─────────────────────────────────────────

    /// Blob write, catalog commit, then best-effort indexing.
    ///
    /// The blob is written first; if the catalog transaction fails the blob
    /// is deleted again before the error is returned, so an item is either
    /// fully applied or not at all.
    pub(crate) async fn apply(&self, plan: ItemPlan, report: &mut JobReport) -> Result<FileRecord> {
        let ItemPlan {
            mut record,
            blob_source,
            index_content,
            restore,
        } = plan;
        let mut saga = Saga::new();

        if let Some(source) = &blob_source {
            let copied = self
                .blobs
                .write(source, &record.storage_path)
                .await
                .with_context(|| format!("Failed to store blob {}", record.storage_path))?;
            record.size = copied;
            saga.register(Compensation::RemoveBlob(record.storage_path.clone()));
        }

        let committed = if restore {
            self.catalog.insert_restored(&record)
        } else {
            self.catalog.create_or_update(&record)
        };
        let saved = match committed {
            Ok(saved) => saved,
            Err(e) => {
                let leftover = saga.compensate(&self.blobs).await;
                if leftover.is_empty() {
                    return Err(e);
                }
                return Err(e.context(format!(
                    "compensation left {} blob(s) behind",
                    leftover.len()
                )));
            }
        };
        saga.commit();

        if let Some(content) = index_content {
            self.index_best_effort(&SearchDocument::from_record(&saved, content), report);
        }
        Ok(saved)
    }

    fn index_best_effort(&self, doc: &SearchDocument, report: &mut JobReport) {
        if let Err(e) = self.index.index_document(doc) {
            warn!(id = doc.id, file = %doc.original_filename, error = %e, "indexing failed; run reindex later");
            report.index_warnings += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::vault::search::{IndexError, IndexPage, IndexStats, SearchHit};
    use crate::vault::search::DEFAULT_MAX_RESULT_WINDOW;
    use tempfile::TempDir;

    /// An index whose every write fails.
    pub struct BrokenIndex;

    impl SearchIndex for BrokenIndex {
        fn ping(&self) -> Result<(), IndexError> {
            Err(IndexError::Missing)
        }
        fn index_exists(&self) -> Result<bool, IndexError> {
            Ok(false)
        }
        fn create_index(&self) -> Result<CreateOutcome, IndexError> {
            Err(IndexError::Missing)
        }
        fn delete_index(&self) -> Result<bool, IndexError> {
            Err(IndexError::Missing)
        }
        fn index_document(&self, _doc: &SearchDocument) -> Result<(), IndexError> {
            Err(IndexError::Missing)
        }
        fn delete_document(&self, _id: i64) -> Result<bool, IndexError> {
            Err(IndexError::Missing)
        }
        fn get_document(&self, _id: i64) -> Result<Option<SearchDocument>, IndexError> {
            Err(IndexError::Missing)
        }
        fn get_page(&self, _from: usize, _size: usize) -> Result<IndexPage, IndexError> {
            Err(IndexError::Missing)
        }
        fn stats(&self) -> Result<IndexStats, IndexError> {
            Err(IndexError::Missing)
        }
        fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>, IndexError> {
            Err(IndexError::Missing)
        }
        fn max_result_window(&self) -> usize {
            DEFAULT_MAX_RESULT_WINDOW
        }
    }

    pub struct Fixture {
        pub tmp: TempDir,
        pub legacy: PathBuf,
        pub reconciler: Reconciler,
        pub index: Arc<SqliteSearchIndex>,
        pub owner: Owner,
    }

    impl Fixture {
        pub fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let legacy = tmp.path().join("legacy");
            std::fs::create_dir_all(&legacy).unwrap();
            let legacy = std::fs::canonicalize(legacy).unwrap();
            let catalog = Catalog::open(&tmp.path().join("catalog.db")).unwrap();
            let owner = catalog.ensure_owner("admin", true).unwrap();
            let index = Arc::new(
                SqliteSearchIndex::open(&tmp.path().join("search.db"), DEFAULT_MAX_RESULT_WINDOW)
                    .unwrap(),
            );
            let blobs = BlobStore::from_path(tmp.path().join("uploads"));
            let reconciler = Reconciler::new(catalog, blobs, index.clone());
            Self {
                tmp,
                legacy,
                reconciler,
                index,
                owner,
            }
        }

        pub fn use_index(&mut self, index: Arc<dyn SearchIndex>) {
            self.reconciler.index = index;
        }

        /// Regular files currently under the uploads root.
        pub fn blob_count(&self) -> usize {
            walkdir::WalkDir::new(self.reconciler.blobs.root())
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .count()
        }

        pub fn touch(&self, rel: &str, body: &[u8]) -> PathBuf {
            let path = self.legacy.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, body).unwrap();
            path
        }

        pub fn opts(&self) -> JobOptions {
            JobOptions {
                source: Some(self.legacy.clone()),
                owner_id: Some(self.owner.id),
                ..JobOptions::default()
            }
        }
    }
}
