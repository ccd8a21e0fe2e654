use crate::vault::catalog::WipeSummary;
use std::fmt::{self, Write as _};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Import,
    Migrate,
    MigrateRemaining,
    SyncStorage,
    Rebuild,
    SyncFromIndex,
    Reindex,
}

impl JobKind {
    pub fn name(self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Migrate => "migrate",
            JobKind::MigrateRemaining => "migrate-remaining",
            JobKind::SyncStorage => "sync-storage",
            JobKind::Rebuild => "rebuild",
            JobKind::SyncFromIndex => "sync-from-index",
            JobKind::Reindex => "reindex",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Limit(usize),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub item: String,
    pub message: String,
}

/// Mutable state for one job run. Passed through the pipeline and
/// returned as the job's summary.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: JobKind,
    pub dry_run: bool,
    /// Items considered (descriptors, records or index documents).
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Dry run only: items that would have been written.
    pub planned: usize,
    /// Stale records updated in place (also counted in `succeeded`).
    pub relocated: usize,
    /// Stored without searchable content because of their extension.
    pub non_searchable: usize,
    /// Parseable files whose extraction failed.
    pub degraded: usize,
    pub index_warnings: usize,
    /// Files outside a subject/category directory, or with names the
    /// structured scan cannot use. Not part of `total`, nor are the three
    /// skip counters below.
    pub invalid_structure: usize,
    pub hidden: usize,
    /// Symlinks, sockets and other non-regular entries.
    pub not_regular: usize,
    pub unreadable: usize,
    /// Restored documents whose owner was replaced by the default owner.
    pub owner_fallbacks: usize,
    /// Index documents beyond the result window that could not be read.
    pub unreachable: usize,
    /// Index documents deleted because their record no longer exists.
    pub removed: usize,
    pub wiped: Option<WipeSummary>,
    pub stopped: Option<StopReason>,
    pub errors: Vec<ItemError>,
    error_limit: usize,
    started: Instant,
    elapsed: Option<Duration>,
}

impl JobReport {
    pub fn new(job: JobKind, dry_run: bool, error_limit: usize) -> Self {
        Self {
            job,
            dry_run,
            total: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            planned: 0,
            relocated: 0,
            non_searchable: 0,
            degraded: 0,
            index_warnings: 0,
            invalid_structure: 0,
            hidden: 0,
            not_regular: 0,
            unreadable: 0,
            owner_fallbacks: 0,
            unreachable: 0,
            removed: 0,
            wiped: None,
            stopped: None,
            errors: Vec::new(),
            error_limit,
            started: Instant::now(),
            elapsed: None,
        }
    }

    /// Items that counted against the job's limit.
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.planned
    }

    pub fn record_failure(&mut self, item: impl Into<String>, error: &anyhow::Error) {
        self.failed += 1;
        if self.errors.len() < self.error_limit {
            self.errors.push(ItemError {
                item: item.into(),
                message: format!("{error:#}"),
            });
        }
    }

    pub fn finish(mut self) -> Self {
        self.elapsed = Some(self.started.elapsed());
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    /// Plain-text summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "{}{} finished in {:.1?}", self.job, mode, self.elapsed());
        let _ = writeln!(out, "  total:      {}", self.total);
        if self.dry_run {
            let _ = writeln!(out, "  planned:    {}", self.planned);
        } else {
            let _ = writeln!(out, "  succeeded:  {}", self.succeeded);
        }
        let _ = writeln!(out, "  skipped:    {}", self.skipped);
        let _ = writeln!(out, "  failed:     {}", self.failed);

        let extras = [
            ("relocated", self.relocated),
            ("not searchable", self.non_searchable),
            ("extraction failed", self.degraded),
            ("index warnings", self.index_warnings),
            ("invalid structure", self.invalid_structure),
            ("hidden", self.hidden),
            ("not a regular file", self.not_regular),
            ("unreadable", self.unreadable),
            ("default owner used", self.owner_fallbacks),
            ("beyond index window", self.unreachable),
            ("orphaned documents removed", self.removed),
        ];
        for (label, count) in extras.into_iter().filter(|(_, n)| *n > 0) {
            let _ = writeln!(out, "  {label}: {count}");
        }
        if let Some(wiped) = self.wiped {
            let _ = writeln!(
                out,
                "  wiped: {} file records, {} favorites",
                wiped.files, wiped.favorites
            );
        }
        match self.stopped {
            Some(StopReason::Limit(limit)) => {
                let _ = writeln!(out, "  stopped after reaching the limit of {limit} items");
            }
            Some(StopReason::Cancelled) => {
                let _ = writeln!(out, "  interrupted; re-run to continue");
            }
            None => {}
        }
        if !self.errors.is_empty() {
            let _ = writeln!(out, "  first {} errors:", self.errors.len());
            for e in &self.errors {
                let _ = writeln!(out, "    {}: {}", e.item, e.message);
            }
        }
        out
    }
}
