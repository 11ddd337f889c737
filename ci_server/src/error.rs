//! Top-level error type of the CI runner.

use std::path::PathBuf;

use crate::services::checkout::CheckoutError;
use crate::services::hook_service::HookError;
use crate::services::registry::RegistryError;
use crate::services::store::StoreError;
use crate::services::supervisor::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("not a full object name: {0:?}")]
    InvalidRevision(String),
    #[error("no repository registered at {0}")]
    UnknownRepository(PathBuf),
    #[error("repository name is required, and a url for remote repositories")]
    InvalidRepository,
}
