//! Canonical blob storage → catalog (and index, for rebuilds).
//!
//! Names in canonical storage are slugs, so the recovered subject and
//! original filename are approximations.

use super::{Confirm, ItemPlan, JobKind, JobOptions, JobReport, Reconciler};
use crate::vault::identity::{IdentityResolver, Resolution};
use crate::vault::naming::{extract_original_filename, unslugify};
use crate::vault::scan::{PathScanner, ScanItem, ScanMode};
use crate::vault::schema::{DirectoryDescriptor, NewFileRecord, ProcessingStatus};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

impl Reconciler {
    /// Catalogs blobs that have no record. Metadata only; nothing is
    /// extracted or indexed.
    pub async fn sync_storage(&self, opts: &JobOptions) -> Result<JobReport> {
        self.restore_from_storage(JobKind::SyncStorage, opts, false).await
    }

    /// Catalogs and indexes every blob without a record. With `clear_all`
    /// the catalog's files and favorites are wiped and the index is
    /// recreated first; that needs `force` or a confirmation from `gate`.
    /// Blobs are never deleted.
    pub async fn rebuild(&self, opts: &JobOptions, gate: &dyn Confirm) -> Result<JobReport> {
        Self::require_dir(self.blobs.root())?;
        self.require_owner(opts)?;
        if opts.clear_all {
            self.confirm_destructive(
                gate,
                opts,
                "Delete every file record and favorite, and recreate the search index?",
            )?;
        }
        self.restore_from_storage(JobKind::Rebuild, opts, true).await
    }

    async fn restore_from_storage(
        &self,
        job: JobKind,
        opts: &JobOptions,
        with_index: bool,
    ) -> Result<JobReport> {
        let root = self.blobs.root().to_path_buf();
        Self::require_dir(&root)?;
        let owner = self.require_owner(opts)?;
        let mut report = self.new_report(job, opts);

        if with_index && !opts.dry_run {
            if opts.clear_all {
                report.wiped = Some(self.catalog.wipe().context("Failed to wipe the catalog")?);
                match self.index.delete_index() {
                    Ok(true) => info!("dropped search index"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "could not drop search index"),
                }
            }
            self.ensure_index();
        }

        let mut resolver = IdentityResolver::new(&self.catalog, &self.blobs);
        let mut scan = PathScanner::new(&root).mode(ScanMode::Structured).scan();
        for item in scan.by_ref() {
            if self.cancelled(&mut report) || Self::limit_reached(opts, &mut report) {
                break;
            }
            let descriptor = match item {
                ScanItem::File(descriptor) => descriptor,
                ScanItem::Skipped { path, reason } => {
                    Self::note_skip(&mut report, &path, &reason);
                    continue;
                }
            };
            report.total += 1;
            self.progress(&report);

            // With clear_all in a dry run nothing was wiped, but everything
            // would have been, so every blob counts as new.
            let resolution = if opts.clear_all && opts.dry_run {
                Ok(Resolution::New)
            } else {
                resolver.resolve_storage_path(&descriptor.relative_path)
            };
            match resolution {
                Ok(Resolution::New) => {}
                Ok(_) => {
                    debug!(storage_path = %descriptor.relative_path, "already cataloged");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(storage_path = %descriptor.relative_path, error = %e, "identity lookup failed");
                    report.record_failure(&descriptor.relative_path, &e);
                    continue;
                }
            }

            if opts.dry_run {
                report.planned += 1;
                continue;
            }

            let index_content = if with_index {
                let extraction = self.extractor.extract(&descriptor.path, &descriptor.extension);
                if !extraction.searchable {
                    report.non_searchable += 1;
                }
                if extraction.degraded {
                    report.degraded += 1;
                }
                Some(extraction.text)
            } else {
                None
            };
            let plan = ItemPlan {
                record: recovered_record(&descriptor, owner.id),
                blob_source: None,
                index_content,
                restore: false,
            };

            match self.apply(plan, &mut report).await {
                Ok(saved) => {
                    debug!(id = saved.id, storage_path = %saved.storage_path, "recovered record");
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(storage_path = %descriptor.relative_path, error = %format!("{e:#}"), "recovery failed");
                    report.record_failure(&descriptor.relative_path, &e);
                }
            }
        }

        debug!(tally = ?scan.tally(), "scan finished");
        Ok(self.finish(report))
    }
}

/// Record for a blob found at `{subject-slug}/{category-slug}/{stored}`.
fn recovered_record(descriptor: &DirectoryDescriptor, owner_id: i64) -> NewFileRecord {
    let mut subject = unslugify(&descriptor.subject);
    if subject.is_empty() {
        subject = descriptor.subject.clone();
    }
    NewFileRecord {
        id: None,
        owner_id,
        original_filename: extract_original_filename(&descriptor.filename),
        stored_filename: descriptor.filename.clone(),
        storage_path: descriptor.relative_path.clone(),
        subject,
        category: descriptor.category,
        size: descriptor.size,
        extension: descriptor.extension.clone(),
        status: ProcessingStatus::Completed,
        created_at: None,
    }
}
