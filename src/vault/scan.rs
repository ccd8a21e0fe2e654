//! Streaming scanner for `{root}/{subject}/{category}/{filename}` trees.
//!
//! Every walked entry becomes a [`ScanItem`]: either a classified
//! [`DirectoryDescriptor`] or a [`SkipReason`]. Nothing here returns an
//! error; callers decide what to do with skips.

use super::naming::{map_category_slug_to_category, split_extension};
use super::schema::DirectoryDescriptor;
use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extension bucket for files that have none.
pub const UNKNOWN_EXTENSION: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Path segments must be clean UTF-8; anything else is skipped.
    #[default]
    Structured,
    /// Lossy names; files with odd names are classified anyway.
    Flat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No subject or category directory between the root and the file.
    Shallow,
    Hidden,
    /// Non-UTF-8 or control characters in a path segment (structured mode).
    UnsafeName,
    /// Symlinks, sockets and other non-regular entries.
    NotRegular,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    File(DirectoryDescriptor),
    Skipped { path: PathBuf, reason: SkipReason },
}

/// Running counts for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTally {
    pub files: usize,
    pub shallow: usize,
    pub hidden: usize,
    pub unsafe_names: usize,
    pub not_regular: usize,
    pub unreadable: usize,
}

impl ScanTally {
    pub fn skipped(&self) -> usize {
        self.shallow + self.hidden + self.unsafe_names + self.not_regular + self.unreadable
    }

    fn record(&mut self, item: &ScanItem) {
        match item {
            ScanItem::File(_) => self.files += 1,
            ScanItem::Skipped { reason, .. } => match reason {
                SkipReason::Shallow => self.shallow += 1,
                SkipReason::Hidden => self.hidden += 1,
                SkipReason::UnsafeName => self.unsafe_names += 1,
                SkipReason::NotRegular => self.not_regular += 1,
                SkipReason::Unreadable(_) => self.unreadable += 1,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathScanner {
    root: PathBuf,
    mode: ScanMode,
}

impl PathScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mode: ScanMode::Structured,
        }
    }

    pub fn mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts a fresh walk. Each call re-reads the tree from the top.
    pub fn scan(&self) -> Scan {
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Scan {
            walker,
            root: self.root.clone(),
            mode: self.mode,
            tally: ScanTally::default(),
        }
    }
}

/// Lazy iterator over one walk of the tree.
pub struct Scan {
    walker: walkdir::IntoIter,
    root: PathBuf,
    mode: ScanMode,
    tally: ScanTally,
}

impl Scan {
    pub fn tally(&self) -> ScanTally {
        self.tally
    }

    fn next_item(&mut self) -> Option<ScanItem> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    return Some(ScanItem::Skipped {
                        path,
                        reason: SkipReason::Unreadable(e.to_string()),
                    });
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if entry.depth() > 0 && is_hidden(entry.file_name()) {
                    self.walker.skip_current_dir();
                }
                continue;
            }
            if !file_type.is_file() {
                return Some(ScanItem::Skipped {
                    path: entry.into_path(),
                    reason: SkipReason::NotRegular,
                });
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    return Some(ScanItem::Skipped {
                        path: entry.into_path(),
                        reason: SkipReason::Unreadable(e.to_string()),
                    })
                }
            };

            let path = entry.into_path();
            return Some(match classify(&self.root, &path, size, self.mode) {
                Ok(descriptor) => ScanItem::File(descriptor),
                Err(reason) => ScanItem::Skipped { path, reason },
            });
        }
    }
}

impl Iterator for Scan {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        let item = self.next_item()?;
        self.tally.record(&item);
        Some(item)
    }
}

fn is_hidden(name: &OsStr) -> bool {
    name.as_encoded_bytes().first() == Some(&b'.')
}

fn segment(name: &OsStr, mode: ScanMode) -> Result<Cow<'_, str>, SkipReason> {
    match mode {
        ScanMode::Structured => {
            let s = name.to_str().ok_or(SkipReason::UnsafeName)?;
            if s.chars().any(char::is_control) {
                return Err(SkipReason::UnsafeName);
            }
            Ok(Cow::Borrowed(s))
        }
        ScanMode::Flat => Ok(name.to_string_lossy()),
    }
}

/// Classifies one regular file below `root`.
///
/// The first directory below the root is the subject, the second the
/// category, and the last segment the filename. Anything between the
/// category and the file is ignored.
pub fn classify(
    root: &Path,
    path: &Path,
    size: u64,
    mode: ScanMode,
) -> Result<DirectoryDescriptor, SkipReason> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| SkipReason::Unreadable(format!("{} is outside the scan root", path.display())))?;

    let parts: Vec<&OsStr> = relative.iter().collect();
    let Some(file_name) = parts.last() else {
        return Err(SkipReason::Shallow);
    };
    if is_hidden(file_name) {
        return Err(SkipReason::Hidden);
    }
    if parts.len() < 3 {
        return Err(SkipReason::Shallow);
    }

    let segments = parts
        .iter()
        .map(|part| segment(part, mode))
        .collect::<Result<Vec<_>, _>>()?;

    let subject = segments[0].to_string();
    let category_token = segments[1].to_string();
    let filename = segments[segments.len() - 1].to_string();
    let (_, extension) = split_extension(&filename);
    let extension = if extension.is_empty() {
        UNKNOWN_EXTENSION.to_string()
    } else {
        extension
    };

    Ok(DirectoryDescriptor {
        path: path.to_path_buf(),
        relative_path: segments.join("/"),
        category: map_category_slug_to_category(&category_token),
        filename,
        subject,
        category_token,
        extension,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::schema::Category;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn files(scan: Scan) -> Vec<DirectoryDescriptor> {
        scan.filter_map(|item| match item {
            ScanItem::File(d) => Some(d),
            ScanItem::Skipped { .. } => None,
        })
        .collect()
    }

    #[test]
    fn classifies_subject_category_and_extension() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Calculus/Exams/Final 2023.PDF", b"12345");

        let found = files(PathScanner::new(tmp.path()).scan());
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.subject, "Calculus");
        assert_eq!(d.category, Category::Exam);
        assert_eq!(d.category_token, "Exams");
        assert_eq!(d.filename, "Final 2023.PDF");
        assert_eq!(d.extension, "pdf");
        assert_eq!(d.size, 5);
        assert_eq!(d.relative_path, "Calculus/Exams/Final 2023.PDF");
    }

    #[test]
    fn shallow_files_are_skipped_and_counted() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "stray.pdf", b"x");
        touch(tmp.path(), "Physics/loose.pdf", b"x");
        touch(tmp.path(), "Physics/Notes/ok.pdf", b"x");

        let mut scan = PathScanner::new(tmp.path()).scan();
        let found: Vec<_> = scan.by_ref().collect();
        assert_eq!(found.len(), 3);
        let tally = scan.tally();
        assert_eq!(tally.files, 1);
        assert_eq!(tally.shallow, 2);
    }

    #[test]
    fn unknown_category_and_missing_extension_are_coerced() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Biology/Photos/README", b"x");

        let found = files(PathScanner::new(tmp.path()).scan());
        assert_eq!(found[0].category, Category::Other);
        assert!(found[0].category_was_coerced());
        assert_eq!(found[0].extension, UNKNOWN_EXTENSION);
    }

    #[test]
    fn hidden_entries_are_not_classified() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Chem/Notes/.DS_Store", b"x");
        touch(tmp.path(), "Chem/.git/objects/abc", b"x");
        touch(tmp.path(), "Chem/Notes/atoms.md", b"x");

        let mut scan = PathScanner::new(tmp.path()).scan();
        let found: Vec<_> = scan.by_ref().collect();
        assert_eq!(found.iter().filter(|i| matches!(i, ScanItem::File(_))).count(), 1);
        assert_eq!(scan.tally().hidden, 1);
    }

    #[test]
    fn rescans_are_repeatable() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Art/Notes/b.txt", b"x");
        touch(tmp.path(), "Art/Notes/a.txt", b"x");

        let scanner = PathScanner::new(tmp.path());
        let first = files(scanner.scan());
        let second = files(scanner.scan());
        assert_eq!(first, second);
        assert_eq!(first[0].filename, "a.txt");
    }

    #[test]
    fn control_characters_need_flat_mode() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Law/Exams/bad\nname.pdf", b"x");

        let structured = PathScanner::new(tmp.path()).scan();
        assert!(files(structured).is_empty());

        let flat = PathScanner::new(tmp.path()).mode(ScanMode::Flat).scan();
        let found = files(flat);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].filename, "bad\nname.pdf");
    }

    #[test]
    fn deeper_nesting_keeps_first_two_segments() {
        let root = Path::new("/legacy");
        let d = classify(
            root,
            Path::new("/legacy/History/Assignments/2021/essay.docx"),
            10,
            ScanMode::Structured,
        )
        .unwrap();
        assert_eq!(d.subject, "History");
        assert_eq!(d.category, Category::Assignment);
        assert_eq!(d.filename, "essay.docx");
    }
}
