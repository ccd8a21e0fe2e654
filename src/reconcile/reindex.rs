//! Catalog → search index. Repairs the index without touching blobs or
//! catalog records.

use super::{Confirm, JobKind, JobOptions, JobReport, ReconcileError, Reconciler};
use crate::vault::schema::{FileRecord, SearchDocument};
use crate::vault::search::CreateOutcome;
use anyhow::Result;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Writes one index document per catalog record, then removes documents
    /// whose record no longer exists.
    ///
    /// Without `reextract` the content already in the index is reused when
    /// the indexed document still describes the same blob; everything else
    /// is extracted again. `recreate` drops the index first (needs `force`
    /// or a confirmation) and implies `reextract`. Index failures fail the
    /// item, since the index is this job's target.
    pub async fn reindex(&self, opts: &JobOptions, gate: &dyn Confirm) -> Result<JobReport> {
        self.index
            .ping()
            .map_err(|e| ReconcileError::IndexUnavailable(e.to_string()))?;
        if opts.recreate {
            self.confirm_destructive(gate, opts, "Drop and recreate the search index?")?;
        }
        let mut report = self.new_report(JobKind::Reindex, opts);

        if !opts.dry_run {
            if opts.recreate {
                self.index
                    .delete_index()
                    .map_err(|e| ReconcileError::IndexUnavailable(e.to_string()))?;
            }
            match self.index.create_index() {
                Ok(CreateOutcome::Created) => info!("created search index"),
                Ok(CreateOutcome::AlreadyExists) => {}
                Err(e) => return Err(ReconcileError::IndexUnavailable(e.to_string()).into()),
            }
        }
        let reextract = opts.reextract || opts.recreate;

        let page_size = self.settings.page_size.max(1);
        let mut after = 0;
        let mut catalog_read = true;
        'pages: loop {
            let records = match self.catalog.records_after(after, page_size) {
                Ok(records) => records,
                Err(e) => {
                    let e = e.context(format!("Failed to page catalog records after id {after}"));
                    warn!(after, error = %format!("{e:#}"), "stopping catalog read");
                    report.record_failure(format!("catalog page after id {after}"), &e);
                    catalog_read = false;
                    break;
                }
            };
            let Some(last) = records.last() else {
                break;
            };
            after = last.id;

            for record in records {
                if self.cancelled(&mut report) || Self::limit_reached(opts, &mut report) {
                    break 'pages;
                }
                report.total += 1;
                self.progress(&report);

                if opts.dry_run {
                    report.planned += 1;
                    continue;
                }

                let item = format!("{} ({})", record.original_filename, record.id);
                let content = match self.content_for(&record, reextract, &mut report).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(id = record.id, error = %format!("{e:#}"), "could not read indexed content");
                        report.record_failure(item, &e);
                        continue;
                    }
                };
                let doc = SearchDocument::from_record(&record, content);
                match self.index.index_document(&doc) {
                    Ok(()) => {
                        debug!(id = record.id, "reindexed");
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        warn!(id = record.id, error = %e, "reindex failed");
                        report.record_failure(item, &anyhow::Error::new(e));
                    }
                }
            }
        }

        // A partial catalog pass cannot tell orphans from unread records.
        if catalog_read && report.stopped.is_none() {
            self.remove_orphans(opts, &mut report);
        }

        Ok(self.finish(report))
    }

    async fn content_for(&self, record: &FileRecord, reextract: bool, report: &mut JobReport) -> Result<String> {
        if !reextract {
            if let Some(existing) = self.index.get_document(record.id)? {
                // Ids are reassigned after a wipe; only reuse text that
                // belongs to this record's blob.
                if existing.storage_path == record.storage_path
                    && existing.stored_filename == record.stored_filename
                {
                    return Ok(existing.content);
                }
                debug!(
                    id = record.id,
                    indexed = %existing.storage_path,
                    cataloged = %record.storage_path,
                    "indexed document belongs to another blob, extracting again"
                );
            }
        }

        if !self.blobs.exists(&record.storage_path).await {
            warn!(id = record.id, storage_path = %record.storage_path, "blob missing, indexing metadata only");
            report.degraded += 1;
            return Ok(String::new());
        }
        let path = self.blobs.resolve(&record.storage_path);
        let extraction = self.extractor.extract(&path, &record.extension);
        if !extraction.searchable {
            report.non_searchable += 1;
        }
        if extraction.degraded {
            report.degraded += 1;
        }
        Ok(extraction.text)
    }

    /// Deletes index documents that have no catalog record. Ids are
    /// collected first so deletions do not shift the page offsets.
    fn remove_orphans(&self, opts: &JobOptions, report: &mut JobReport) {
        match self.index.index_exists() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "cannot look for orphaned documents");
                report.record_failure("orphan scan", &anyhow::Error::new(e));
                return;
            }
        }

        let page_size = self.settings.page_size.max(1);
        let mut orphans = Vec::new();
        let mut from = 0;
        let indexed = loop {
            let page = match self.index.get_page(from, page_size) {
                Ok(page) => page,
                Err(e) => {
                    let e = anyhow::Error::new(e).context(format!("Failed to read index page at offset {from}"));
                    warn!(from, error = %format!("{e:#}"), "stopping orphan scan");
                    report.record_failure(format!("index page {from}"), &e);
                    return;
                }
            };
            if page.consumed == 0 {
                break page.total;
            }
            from += page.consumed;

            let ids = page
                .documents
                .iter()
                .map(|doc| doc.id)
                .chain(page.rejected.iter().filter_map(|rejected| rejected.id));
            for id in ids {
                match self.catalog.find_by_id(id) {
                    Ok(Some(_)) => {}
                    Ok(None) => orphans.push(id),
                    Err(e) => report.record_failure(format!("document {id}"), &e),
                }
            }
        };
        if indexed > from {
            report.unreachable = indexed - from;
            warn!(unreachable = report.unreachable, "documents beyond the index result window were not checked");
        }

        for id in orphans {
            if opts.dry_run {
                report.planned += 1;
                continue;
            }
            match self.index.delete_document(id) {
                Ok(_) => {
                    debug!(id, "removed orphaned document");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(id, error = %e, "could not remove orphaned document");
                    report.record_failure(format!("document {id}"), &anyhow::Error::new(e));
                }
            }
        }
        if report.removed > 0 {
            info!(removed = report.removed, "removed documents without a catalog record");
        }
    }
}
