//! JSON views of builds and repositories.

use serde::{Deserialize, Serialize};

use crate::models::build::{BuildId, BuildRecord, BuildState};
use crate::models::repository::Repository;

/// JSON response for a build (metadata only, output has its own endpoint).
#[derive(Debug, Serialize, Deserialize)]
pub struct BuildJson {
    pub repository_id: i64,
    pub number: i64,
    pub state: BuildState,
    pub revision: String,
    pub ref_name: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub return_code: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&BuildRecord> for BuildJson {
    fn from(record: &BuildRecord) -> Self {
        Self {
            repository_id: record.id.repository_id,
            number: record.id.number,
            state: record.state(),
            revision: record.commit.revision.clone(),
            ref_name: record.commit.ref_name.clone(),
            message: record.commit.message.clone(),
            author_name: record.commit.author_name.clone(),
            author_email: record.commit.author_email.clone(),
            return_code: record.return_code(),
            error: record.error().map(str::to_string),
            duration_ms: record.duration().map(|d| d.num_milliseconds()),
            created_at: record.created_at(),
            started_at: record.started_at(),
            finished_at: record.finished_at(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryJson {
    pub id: i64,
    pub name: String,
    pub remote: bool,
    pub url: Option<String>,
    pub last_build_number: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Repository> for RepositoryJson {
    fn from(repo: Repository) -> Self {
        Self {
            id: repo.id,
            name: repo.name,
            remote: repo.remote,
            url: repo.url,
            last_build_number: repo.last_build_number,
            created_at: repo.created_at,
        }
    }
}

/// Response to an accepted hook.
#[derive(Debug, Serialize, Deserialize)]
pub struct HookResponse {
    pub repository_id: i64,
    pub number: i64,
}

impl From<BuildId> for HookResponse {
    fn from(id: BuildId) -> Self {
        Self {
            repository_id: id.repository_id,
            number: id.number,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub running_builds: usize,
}
