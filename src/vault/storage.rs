use super::naming::slugify;
use super::schema::Category;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Directory used when a subject slugs to nothing.
const FALLBACK_SUBJECT_DIR: &str = "untitled";

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("short copy into {path}: expected {expected} bytes, copied {copied}")]
    ShortCopy {
        path: PathBuf,
        expected: u64,
        copied: u64,
    },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BlobError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        BlobError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Canonical blob storage laid out as `{subject}/{category}/{filename}`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_dir: PathBuf,
}

impl BlobStore {
    pub fn from_path(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.base_dir
    }

    /// Relative storage path for a new blob.
    pub fn canonical_path(subject: &str, category: Category, unique_filename: &str) -> String {
        let mut subject_dir = slugify(subject);
        if subject_dir.is_empty() {
            subject_dir.push_str(FALLBACK_SUBJECT_DIR);
        }
        format!("{}/{}/{}", subject_dir, category.slug(), unique_filename)
    }

    /// Absolute path for a storage path. Relative paths live under the
    /// root; absolute (legacy) paths are returned as they are.
    pub fn resolve(&self, storage_path: &str) -> PathBuf {
        let path = Path::new(storage_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub async fn exists(&self, storage_path: &str) -> bool {
        if storage_path.is_empty() {
            return false;
        }
        fs::metadata(self.resolve(storage_path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Copies `source` to `rel_path` under the root and returns the bytes
    /// written. Never replaces an existing blob.
    pub async fn write(&self, source: &Path, rel_path: &str) -> Result<u64, BlobError> {
        let dest = self.base_dir.join(rel_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::io("create directory", parent, e))?;
        }

        let expected = fs::metadata(source)
            .await
            .map_err(|e| BlobError::io("stat", source, e))?
            .len();
        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| BlobError::io("open", source, e))?;
        let mut writer = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BlobError::AlreadyExists(dest))
            }
            Err(e) => return Err(BlobError::io("create", &dest, e)),
        };

        let copied = match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                drop(writer);
                self.discard_partial(&dest).await;
                return Err(BlobError::io("copy into", &dest, e));
            }
        };
        if let Err(e) = writer.flush().await {
            drop(writer);
            self.discard_partial(&dest).await;
            return Err(BlobError::io("flush", &dest, e));
        }
        if copied != expected {
            drop(writer);
            self.discard_partial(&dest).await;
            return Err(BlobError::ShortCopy {
                path: dest,
                expected,
                copied,
            });
        }

        debug!(source = %source.display(), dest = %dest.display(), bytes = copied, "wrote blob");
        Ok(copied)
    }

    /// Deletes a blob. Missing blobs are not an error.
    pub async fn remove(&self, storage_path: &str) -> Result<(), BlobError> {
        let abs = self.resolve(storage_path);
        match fs::remove_file(&abs).await {
            Ok(()) => {
                debug!(path = %abs.display(), "removed blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::io("remove", &abs, e)),
        }
    }

    async fn discard_partial(&self, dest: &Path) {
        if let Err(e) = fs::remove_file(dest).await {
            warn!(path = %dest.display(), error = %e, "failed to remove partial blob");
        }
    }
}
