//! Legacy tree → canonical blob storage + catalog + index.
//!
//! Bytes are copied under a fresh unique name; the legacy tree is never
//! modified. Records that were imported earlier (or whose canonical blob
//! went missing) are relocated in place, keeping their id and owner.

use super::{ItemPlan, JobKind, JobOptions, JobReport, Reconciler};
use crate::vault::extract::ContentExtractor;
use crate::vault::identity::{IdentityResolver, Resolution};
use crate::vault::naming::{generate_unique_filename, split_extension};
use crate::vault::scan::{PathScanner, ScanItem, ScanMode};
use crate::vault::schema::{DirectoryDescriptor, NewFileRecord, ProcessingStatus};
use crate::vault::storage::BlobStore;
use anyhow::Result;
use tracing::{debug, info, warn};

impl Reconciler {
    pub async fn migrate(&self, opts: &JobOptions) -> Result<JobReport> {
        self.migrate_tree(JobKind::Migrate, ScanMode::Structured, opts).await
    }

    /// Same as [`Reconciler::migrate`] but classifies files whose names the
    /// structured scan rejects.
    pub async fn migrate_remaining(&self, opts: &JobOptions) -> Result<JobReport> {
        self.migrate_tree(JobKind::MigrateRemaining, ScanMode::Flat, opts).await
    }

    async fn migrate_tree(&self, job: JobKind, mode: ScanMode, opts: &JobOptions) -> Result<JobReport> {
        let source = self.require_source(opts)?;
        let owner = self.require_owner(opts)?;
        let mut report = self.new_report(job, opts);
        if !opts.dry_run {
            self.ensure_index();
        }

        let mut resolver = IdentityResolver::new(&self.catalog, &self.blobs);
        let mut scan = PathScanner::new(&source).mode(mode).scan();
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

            let resolution = match resolver.resolve_migration(&descriptor).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(file = %descriptor.relative_path, error = %e, "identity lookup failed");
                    report.record_failure(&descriptor.relative_path, &e);
                    continue;
                }
            };
            let stale = match resolution {
                Resolution::AlreadyPresent { id } => {
                    debug!(file = %descriptor.relative_path, ?id, "already migrated");
                    report.skipped += 1;
                    continue;
                }
                Resolution::New => None,
                Resolution::Stale(record) => Some(record),
            };

            if !ContentExtractor::is_parseable(&descriptor.extension) {
                report.non_searchable += 1;
            }
            if opts.dry_run {
                report.planned += 1;
                continue;
            }

            let extraction = self.extractor.extract(&descriptor.path, &descriptor.extension);
            if extraction.degraded {
                report.degraded += 1;
            }

            let mut record = canonical_record(&descriptor, owner.id);
            if let Some(previous) = &stale {
                record.id = Some(previous.id);
                record.owner_id = previous.owner_id;
            }
            let plan = ItemPlan {
                record,
                blob_source: Some(descriptor.path.clone()),
                index_content: Some(extraction.text),
                restore: false,
            };

            match self.apply(plan, &mut report).await {
                Ok(saved) => {
                    if let Some(previous) = stale {
                        info!(
                            id = saved.id,
                            from = %previous.storage_path,
                            to = %saved.storage_path,
                            "relocated stale record"
                        );
                        report.relocated += 1;
                    } else {
                        debug!(id = saved.id, storage_path = %saved.storage_path, "migrated");
                    }
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(file = %descriptor.relative_path, error = %format!("{e:#}"), "migration failed");
                    report.record_failure(&descriptor.relative_path, &e);
                }
            }
        }

        debug!(tally = ?scan.tally(), "scan finished");
        Ok(self.finish(report))
    }
}

/// New canonical record for a legacy file, under a freshly generated
/// unique name.
fn canonical_record(descriptor: &DirectoryDescriptor, owner_id: i64) -> NewFileRecord {
    let (stem, ext) = split_extension(&descriptor.filename);
    let unique = generate_unique_filename(stem, &ext);
    NewFileRecord {
        id: None,
        owner_id,
        original_filename: descriptor.filename.clone(),
        storage_path: BlobStore::canonical_path(&descriptor.subject, descriptor.category, &unique),
        stored_filename: unique,
        subject: descriptor.subject.clone(),
        category: descriptor.category,
        size: descriptor.size,
        extension: descriptor.extension.clone(),
        status: ProcessingStatus::Completed,
        created_at: None,
    }
}
