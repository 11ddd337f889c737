//! A registered repository whose pushes trigger builds.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    /// Mirrors `url` instead of receiving pushes directly.
    pub remote: bool,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Sequence number of the most recent build, 0 when never built.
    pub last_build_number: i64,
}

impl Repository {
    /// Bare repository location under the configured repos directory.
    pub fn local_path(&self, repos_dir: &Path) -> PathBuf {
        repos_dir.join(format!("{}.git", self.id))
    }
}

/// Registration request for a repository.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRepository {
    pub name: String,
    #[serde(default)]
    pub remote: bool,
    pub url: Option<String>,
}

impl NewRepository {
    /// Trim user input; `None` when the name is empty or a remote lacks its url.
    pub fn validated(self) -> Option<Self> {
        let name = self.name.trim().to_string();
        let url = self
            .url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        if name.is_empty() || (self.remote && url.is_none()) {
            return None;
        }
        Some(Self {
            name,
            remote: self.remote,
            url,
        })
    }
}
