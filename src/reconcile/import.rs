//! Legacy tree → catalog + index, leaving the files where they are.

use super::{ItemPlan, JobKind, JobOptions, JobReport, Reconciler};
use crate::vault::extract::ContentExtractor;
use crate::vault::identity::{IdentityResolver, Resolution};
use crate::vault::scan::{PathScanner, ScanItem, ScanMode};
use crate::vault::schema::{NewFileRecord, ProcessingStatus};
use anyhow::Result;
use tracing::{debug, warn};

impl Reconciler {
    /// Catalogs every file under `opts.source` in place. Records keep the
    /// absolute source path; no bytes are copied.
    pub async fn import(&self, opts: &JobOptions) -> Result<JobReport> {
        let source = self.require_source(opts)?;
        let owner = self.require_owner(opts)?;
        let mut report = self.new_report(JobKind::Import, opts);
        if !opts.dry_run {
            self.ensure_index();
        }

        let mut resolver = IdentityResolver::new(&self.catalog, &self.blobs);
        let mut scan = PathScanner::new(&source).mode(ScanMode::Structured).scan();
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

            let resolution = match resolver.resolve_import(&descriptor, opts.skip_duplicates) {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(file = %descriptor.relative_path, error = %e, "identity lookup failed");
                    report.record_failure(&descriptor.relative_path, &e);
                    continue;
                }
            };
            if let Resolution::AlreadyPresent { id } = resolution {
                debug!(file = %descriptor.relative_path, ?id, "already imported");
                report.skipped += 1;
                continue;
            }

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
            let plan = ItemPlan {
                record: NewFileRecord {
                    id: None,
                    owner_id: owner.id,
                    original_filename: descriptor.filename.clone(),
                    stored_filename: descriptor.filename.clone(),
                    storage_path: descriptor.path.to_string_lossy().into_owned(),
                    subject: descriptor.subject.clone(),
                    category: descriptor.category,
                    size: descriptor.size,
                    extension: descriptor.extension.clone(),
                    status: ProcessingStatus::Completed,
                    created_at: None,
                },
                blob_source: None,
                index_content: Some(extraction.text),
                restore: false,
            };

            match self.apply(plan, &mut report).await {
                Ok(saved) => {
                    debug!(id = saved.id, file = %descriptor.relative_path, "imported");
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(file = %descriptor.relative_path, error = %format!("{e:#}"), "import failed");
                    report.record_failure(&descriptor.relative_path, &e);
                }
            }
        }

        debug!(tally = ?scan.tally(), "scan finished");
        Ok(self.finish(report))
    }
}
