use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Fixed set of document categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    LectureNotes,
    Exam,
    Assignment,
    #[default]
    Other,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::LectureNotes,
        Category::Exam,
        Category::Assignment,
        Category::Other,
    ];

    /// Value persisted in the catalog and the search index.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::LectureNotes => "lecture_notes",
            Category::Exam => "exam",
            Category::Assignment => "assignment",
            Category::Other => "other",
        }
    }

    /// Directory token used in canonical storage paths.
    pub fn slug(self) -> &'static str {
        match self {
            Category::LectureNotes => "lecture-notes",
            Category::Exam => "exams",
            Category::Assignment => "assignments",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == value)
            .ok_or_else(|| format!("unknown category '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown processing status '{other}'")),
        }
    }
}

/// Authoritative metadata for one stored document.
///
/// `storage_path` is relative to the uploads root for canonical blobs and
/// absolute for files that still live in a legacy tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub owner_id: i64,
    pub original_filename: String,
    pub stored_filename: String,
    pub storage_path: String,
    pub subject: String,
    pub category: Category,
    pub size: u64,
    pub extension: String,
    pub status: ProcessingStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl FileRecord {
    pub fn is_canonical(&self) -> bool {
        is_canonical_path(&self.storage_path)
    }
}

/// A record that has not been written yet. `id` is only set when restoring
/// a record whose identity is already known (e.g. from the search index).
#[derive(Debug, Clone, PartialEq)]
pub struct NewFileRecord {
    pub id: Option<i64>,
    pub owner_id: i64,
    pub original_filename: String,
    pub stored_filename: String,
    pub storage_path: String,
    pub subject: String,
    pub category: Category,
    pub size: u64,
    pub extension: String,
    pub status: ProcessingStatus,
    pub created_at: Option<String>,
}

pub fn is_canonical_path(storage_path: &str) -> bool {
    !storage_path.is_empty() && std::path::Path::new(storage_path).is_relative()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub username: String,
    pub is_staff: bool,
    pub created_at: String,
}

/// Derived search-index document. Mirrors the descriptive fields of a
/// [`FileRecord`] plus the extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: i64,
    pub owner_id: i64,
    pub original_filename: String,
    pub stored_filename: String,
    pub storage_path: String,
    pub subject: String,
    pub category: Category,
    pub extension: String,
    pub size: u64,
    pub created_at: String,
    pub content: String,
}

impl SearchDocument {
    pub fn from_record(record: &FileRecord, content: String) -> Self {
        Self {
            id: record.id,
            owner_id: record.owner_id,
            original_filename: record.original_filename.clone(),
            stored_filename: record.stored_filename.clone(),
            storage_path: record.storage_path.clone(),
            subject: record.subject.clone(),
            category: record.category,
            extension: record.extension.clone(),
            size: record.size,
            created_at: record.created_at.clone(),
            content,
        }
    }
}

/// One file found by the scanner. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryDescriptor {
    pub path: PathBuf,
    /// Path below the scan root, always `/`-separated.
    pub relative_path: String,
    pub filename: String,
    pub subject: String,
    pub category_token: String,
    pub category: Category,
    pub extension: String,
    pub size: u64,
}

impl DirectoryDescriptor {
    /// Whether the category directory matched a known token.
    pub fn category_was_coerced(&self) -> bool {
        crate::vault::naming::known_category_slug(&self.category_token).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_its_persisted_value() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert!("lecture-notes".parse::<Category>().is_err());
    }

    #[test]
    fn canonical_paths_are_relative() {
        assert!(is_canonical_path("calculus/exams/final_0a1b2c3d4e5f.pdf"));
        assert!(!is_canonical_path("/srv/legacy/Calculus/Exams/final.pdf"));
        assert!(!is_canonical_path(""));
    }

    #[test]
    fn status_parses_known_values_only() {
        assert_eq!(
            "completed".parse::<ProcessingStatus>().unwrap(),
            ProcessingStatus::Completed
        );
        assert!("done".parse::<ProcessingStatus>().is_err());
    }
}
