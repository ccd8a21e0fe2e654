//! Decides whether a discovered item is already accounted for.
//!
//! Each job direction has its own dedup key because the stores disagree
//! about identity: legacy trees only know absolute paths, canonical storage
//! knows its own relative paths, and the search index carries file ids.

use super::catalog::Catalog;
use super::schema::{Category, DirectoryDescriptor, FileRecord};
use super::storage::BlobStore;
use anyhow::Result;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    SourcePath(String),
    Identity {
        subject: String,
        original_filename: String,
        category: Category,
    },
    StoragePath(String),
    FileId(i64),
}

impl DedupKey {
    pub fn identity(descriptor: &DirectoryDescriptor) -> Self {
        DedupKey::Identity {
            subject: descriptor.subject.clone(),
            original_filename: descriptor.filename.clone(),
            category: descriptor.category,
        }
    }

    pub fn source_path(descriptor: &DirectoryDescriptor) -> Self {
        DedupKey::SourcePath(descriptor.path.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    New,
    /// Already in the catalog, or claimed earlier in this run (`id` is
    /// `None` then).
    AlreadyPresent { id: Option<i64> },
    /// A record exists but points at a legacy path or a missing blob and
    /// must be relocated in place.
    Stale(FileRecord),
}

/// Resolver for one job run. Remembers what the run has claimed so that
/// duplicates within a single scan (and dry runs, which write nothing)
/// still resolve consistently.
pub struct IdentityResolver<'a> {
    catalog: &'a Catalog,
    blobs: &'a BlobStore,
    claimed: HashSet<DedupKey>,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(catalog: &'a Catalog, blobs: &'a BlobStore) -> Self {
        Self {
            catalog,
            blobs,
            claimed: HashSet::new(),
        }
    }

    /// Claims `keys` and returns whether any of them was claimed before.
    fn claim(&mut self, keys: impl IntoIterator<Item = DedupKey>) -> bool {
        let mut seen = false;
        for key in keys {
            seen |= !self.claimed.insert(key);
        }
        seen
    }

    fn is_claimed(&self, key: &DedupKey) -> bool {
        self.claimed.contains(key)
    }

    /// Legacy tree → catalog without relocation. Keyed by absolute path;
    /// `skip_duplicates` also treats a subject/filename/category match as
    /// present.
    pub fn resolve_import(
        &mut self,
        descriptor: &DirectoryDescriptor,
        skip_duplicates: bool,
    ) -> Result<Resolution> {
        let path_key = DedupKey::source_path(descriptor);
        let identity_key = DedupKey::identity(descriptor);

        if self.is_claimed(&path_key) || (skip_duplicates && self.is_claimed(&identity_key)) {
            return Ok(Resolution::AlreadyPresent { id: None });
        }

        let source = descriptor.path.to_string_lossy();
        if let Some(record) = self.catalog.find_by_storage_path(&source)? {
            self.claim([path_key, identity_key]);
            return Ok(Resolution::AlreadyPresent { id: Some(record.id) });
        }
        if skip_duplicates {
            if let Some(record) = self.catalog.find_by_identity(
                &descriptor.subject,
                &descriptor.filename,
                descriptor.category,
            )? {
                self.claim([path_key, identity_key]);
                return Ok(Resolution::AlreadyPresent { id: Some(record.id) });
            }
        }

        self.claim([path_key, identity_key]);
        Ok(Resolution::New)
    }

    /// Legacy tree → canonical storage.
    ///
    /// A record that still points at this exact source path was imported
    /// but never relocated. Otherwise the subject/filename/category triple
    /// decides: a canonical record with its blob in place is done, anything
    /// else is stale.
    pub async fn resolve_migration(&mut self, descriptor: &DirectoryDescriptor) -> Result<Resolution> {
        let path_key = DedupKey::source_path(descriptor);
        let identity_key = DedupKey::identity(descriptor);

        if self.is_claimed(&identity_key) {
            return Ok(Resolution::AlreadyPresent { id: None });
        }

        let source = descriptor.path.to_string_lossy();
        if let Some(record) = self.catalog.find_by_storage_path(&source)? {
            self.claim([path_key, identity_key]);
            return Ok(Resolution::Stale(record));
        }

        let found = self.catalog.find_by_identity(
            &descriptor.subject,
            &descriptor.filename,
            descriptor.category,
        )?;
        self.claim([path_key, identity_key]);
        let Some(record) = found else {
            return Ok(Resolution::New);
        };
        if record.is_canonical() && self.blobs.exists(&record.storage_path).await {
            Ok(Resolution::AlreadyPresent { id: Some(record.id) })
        } else {
            Ok(Resolution::Stale(record))
        }
    }

    /// Canonical storage → catalog, keyed by the exact relative path.
    pub fn resolve_storage_path(&mut self, storage_path: &str) -> Result<Resolution> {
        let key = DedupKey::StoragePath(storage_path.to_string());
        if self.is_claimed(&key) {
            return Ok(Resolution::AlreadyPresent { id: None });
        }
        let found = self.catalog.find_by_storage_path(storage_path)?;
        self.claim([key]);
        Ok(match found {
            Some(record) => Resolution::AlreadyPresent { id: Some(record.id) },
            None => Resolution::New,
        })
    }

    /// Search index → catalog, keyed by the file id inside the document.
    pub fn resolve_file_id(&mut self, id: i64) -> Result<Resolution> {
        let key = DedupKey::FileId(id);
        if self.is_claimed(&key) {
            return Ok(Resolution::AlreadyPresent { id: Some(id) });
        }
        let found = self.catalog.find_by_id(id)?;
        self.claim([key]);
        Ok(match found {
            Some(record) => Resolution::AlreadyPresent { id: Some(record.id) },
            None => Resolution::New,
        })
    }
}
