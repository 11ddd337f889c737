//! Repository registration and lookup.

use std::path::Path;

use crate::error::CiError;
use crate::models::repository::{NewRepository, Repository};
use crate::services::checkout::Checkout;
use crate::services::store::BuildStore;

/// List all registered repositories.
pub async fn list_repositories(store: &dyn BuildStore) -> Result<Vec<Repository>, CiError> {
    Ok(store.list_repositories().await?)
}

/// Register a repository and create its local git repository. The record is
/// dropped again when the git repository cannot be created.
pub async fn create_repository(
    store: &dyn BuildStore,
    checkout: &dyn Checkout,
    new_repository: NewRepository,
) -> Result<Repository, CiError> {
    let new_repository = new_repository
        .validated()
        .ok_or(CiError::InvalidRepository)?;

    let repository = store.insert_repository(new_repository).await?;
    if let Err(e) = checkout.init(&repository).await {
        tracing::warn!(repo = repository.id, "Repository init failed, unregistering: {e}");
        store.delete_repository(repository.id).await?;
        return Err(e.into());
    }

    tracing::info!(
        repo = repository.id,
        name = %repository.name,
        remote = repository.remote,
        "Repository registered"
    );
    Ok(repository)
}

/// Find the repository a hook's `repo_path` refers to.
///
/// Hooks may report relative or symlinked paths; both sides are compared in
/// canonical form when the path exists.
pub async fn find_by_path(
    store: &dyn BuildStore,
    repos_dir: &Path,
    path: &Path,
) -> Result<Option<Repository>, CiError> {
    let canonical = tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf());
    Ok(store.find_repository_by_path(repos_dir, &canonical).await?)
}
