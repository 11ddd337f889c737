//! Persistence for build records and repositories.
//!
//! [`BuildStore`] is the seam the rest of the server talks to. Two stores ship:
//! [`MemoryStore`] for tests and throwaway runs, and [`JsonFileStore`] which
//! rewrites one JSON document atomically (temp file + rename) on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::build::{BuildId, BuildRecord};
use crate::models::repository::{NewRepository, Repository};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown repository {0}")]
    UnknownRepository(i64),
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Insert or replace a build record.
    async fn save(&self, record: &BuildRecord) -> Result<(), StoreError>;
    async fn find(&self, id: BuildId) -> Result<Option<BuildRecord>, StoreError>;
    /// Every build, newest first.
    async fn list_all(&self) -> Result<Vec<BuildRecord>, StoreError>;

    async fn insert_repository(&self, new: NewRepository) -> Result<Repository, StoreError>;
    /// Drop a repository record; `false` when it did not exist.
    async fn delete_repository(&self, id: i64) -> Result<bool, StoreError>;
    async fn find_repository(&self, id: i64) -> Result<Option<Repository>, StoreError>;
    async fn find_repository_by_path(
        &self,
        repos_dir: &Path,
        path: &Path,
    ) -> Result<Option<Repository>, StoreError>;
    async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError>;
    /// Allocate the next build number of a repository.
    async fn next_build_number(&self, repository_id: i64) -> Result<i64, StoreError>;
}

/// The whole persisted state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Database {
    repositories: Vec<Repository>,
    builds: Vec<BuildRecord>,
}

/// In-memory indexes over a [`Database`].
#[derive(Debug, Default)]
struct Tables {
    repositories: BTreeMap<i64, Repository>,
    builds: BTreeMap<BuildId, BuildRecord>,
}

impl Tables {
    fn from_database(db: Database) -> Self {
        Self {
            repositories: db.repositories.into_iter().map(|r| (r.id, r)).collect(),
            builds: db.builds.into_iter().map(|b| (b.id, b)).collect(),
        }
    }

    fn to_database(&self) -> Database {
        Database {
            repositories: self.repositories.values().cloned().collect(),
            builds: self.builds.values().cloned().collect(),
        }
    }

    fn save(&mut self, record: &BuildRecord) {
        self.builds.insert(record.id, record.clone());
    }

    fn list_all(&self) -> Vec<BuildRecord> {
        let mut builds: Vec<BuildRecord> = self.builds.values().cloned().collect();
        builds.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id.cmp(&a.id))
        });
        builds
    }

    fn insert_repository(&mut self, new: NewRepository) -> Repository {
        let id = self.repositories.keys().next_back().copied().unwrap_or(0) + 1;
        let repository = Repository {
            id,
            name: new.name,
            remote: new.remote,
            url: new.url,
            created_at: Utc::now(),
            last_build_number: 0,
        };
        self.repositories.insert(id, repository.clone());
        repository
    }

    fn find_repository_by_path(&self, repos_dir: &Path, path: &Path) -> Option<Repository> {
        self.repositories
            .values()
            .find(|r| r.local_path(repos_dir) == path)
            .cloned()
    }

    fn next_build_number(&mut self, repository_id: i64) -> Result<i64, StoreError> {
        let repository = self
            .repositories
            .get_mut(&repository_id)
            .ok_or(StoreError::UnknownRepository(repository_id))?;
        repository.last_build_number += 1;
        Ok(repository.last_build_number)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn save(&self, record: &BuildRecord) -> Result<(), StoreError> {
        self.tables.lock().await.save(record);
        Ok(())
    }

    async fn find(&self, id: BuildId) -> Result<Option<BuildRecord>, StoreError> {
        Ok(self.tables.lock().await.builds.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<BuildRecord>, StoreError> {
        Ok(self.tables.lock().await.list_all())
    }

    async fn insert_repository(&self, new: NewRepository) -> Result<Repository, StoreError> {
        Ok(self.tables.lock().await.insert_repository(new))
    }

    async fn delete_repository(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.repositories.remove(&id).is_some())
    }

    async fn find_repository(&self, id: i64) -> Result<Option<Repository>, StoreError> {
        Ok(self.tables.lock().await.repositories.get(&id).cloned())
    }

    async fn find_repository_by_path(
        &self,
        repos_dir: &Path,
        path: &Path,
    ) -> Result<Option<Repository>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .find_repository_by_path(repos_dir, path))
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        Ok(self.tables.lock().await.repositories.values().cloned().collect())
    }

    async fn next_build_number(&self, repository_id: i64) -> Result<i64, StoreError> {
        self.tables.lock().await.next_build_number(repository_id)
    }
}

/// Durable store backed by a single JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Load `path`, or start empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => Tables::from_database(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        tracing::info!(
            path = %path.display(),
            builds = tables.builds.len(),
            repositories = tables.repositories.len(),
            "Store opened"
        );
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    /// Write the tables out. Called with the lock held so writes never interleave.
    async fn flush(&self, tables: &Tables) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&tables.to_database())?;
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl BuildStore for JsonFileStore {
    async fn save(&self, record: &BuildRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.save(record);
        self.flush(&tables).await
    }

    async fn find(&self, id: BuildId) -> Result<Option<BuildRecord>, StoreError> {
        Ok(self.tables.lock().await.builds.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<BuildRecord>, StoreError> {
        Ok(self.tables.lock().await.list_all())
    }

    async fn insert_repository(&self, new: NewRepository) -> Result<Repository, StoreError> {
        let mut tables = self.tables.lock().await;
        let repository = tables.insert_repository(new);
        self.flush(&tables).await?;
        Ok(repository)
    }

    async fn delete_repository(&self, id: i64) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.repositories.remove(&id).is_none() {
            return Ok(false);
        }
        self.flush(&tables).await?;
        Ok(true)
    }

    async fn find_repository(&self, id: i64) -> Result<Option<Repository>, StoreError> {
        Ok(self.tables.lock().await.repositories.get(&id).cloned())
    }

    async fn find_repository_by_path(
        &self,
        repos_dir: &Path,
        path: &Path,
    ) -> Result<Option<Repository>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .find_repository_by_path(repos_dir, path))
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        Ok(self.tables.lock().await.repositories.values().cloned().collect())
    }

    async fn next_build_number(&self, repository_id: i64) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock().await;
        let number = tables.next_build_number(repository_id)?;
        self.flush(&tables).await?;
        Ok(number)
    }
}
