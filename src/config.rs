use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::vault::extract::DEFAULT_MAX_TEXT_BYTES;
use crate::vault::search::DEFAULT_MAX_RESULT_WINDOW;

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub search: SearchConfig,
    pub owner: OwnerConfig,
    pub jobs: JobsConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of canonical blob storage.
    pub uploads_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub path: String,
    /// Deepest offset the index will page to.
    pub max_result_window: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OwnerConfig {
    /// Owner used when a restored document references an unknown user.
    pub default_username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    /// Errors listed in a job summary.
    pub error_report_limit: usize,
    /// Log a progress line every N items.
    pub progress_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_text_bytes: usize,
}

fn data_dir() -> PathBuf {
    ProjectDirs::from("org", "coursevault", "coursevault")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".coursevault"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: data_dir().join("uploads").display().to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("catalog.db").display().to_string(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("search.db").display().to_string(),
            max_result_window: DEFAULT_MAX_RESULT_WINDOW,
            page_size: 500,
        }
    }
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            default_username: "admin".to_string(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            error_report_limit: 10,
            progress_every: 100,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
        }
    }
}

impl Config {
    /// Default config file location for this platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "coursevault", "coursevault")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads `explicit` if given, else the platform default. A missing
    /// default file means defaults; a missing explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (Self::default_path(), false),
        };

        let config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                debug!(path = %path.display(), "loaded config");
                Self::from_toml(&raw).with_context(|| format!("Invalid config {}", path.display()))?
            }
            Some(path) if required => bail!("config file {} does not exist", path.display()),
            _ => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.page_size == 0 {
            bail!("search.page_size must be greater than zero");
        }
        if self.search.max_result_window == 0 {
            bail!("search.max_result_window must be greater than zero");
        }
        if self.owner.default_username.trim().is_empty() {
            bail!("owner.default_username must not be empty");
        }
        if self.storage.uploads_dir.trim().is_empty() {
            bail!("storage.uploads_dir must not be empty");
        }
        Ok(())
    }

    pub fn uploads_dir(&self) -> PathBuf {
        expand(&self.storage.uploads_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        expand(&self.database.path)
    }

    pub fn search_path(&self) -> PathBuf {
        expand(&self.search.path)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
