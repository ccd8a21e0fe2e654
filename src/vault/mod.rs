//! Vault — the three stores and the pieces that read them
//!
//! Canonical blob storage, the authoritative catalog, the derived search
//! index, plus scanning, naming, text extraction and identity resolution.

pub mod catalog;
pub mod extract;
pub mod identity;
pub mod naming;
pub mod scan;
pub mod schema;
pub mod search;
pub mod storage;

pub use catalog::Catalog;
pub use extract::ContentExtractor;
pub use identity::{IdentityResolver, Resolution};
pub use scan::{PathScanner, ScanMode};
pub use schema::{Category, DirectoryDescriptor, FileRecord, ProcessingStatus, SearchDocument};
pub use search::{SearchIndex, SqliteSearchIndex};
pub use storage::BlobStore;
