//! Build requests delivered by git `post-receive` hooks.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Revision git reports for a deleted ref.
const NULL_REVISION: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    pub repo_path: PathBuf,
    pub old_revision: String,
    pub new_revision: String,
    pub ref_name: String,
}

impl HookEvent {
    /// A push that deleted the ref; there is nothing to build.
    pub fn is_deletion(&self) -> bool {
        self.new_revision.is_empty() || self.new_revision == NULL_REVISION
    }
}

/// Full hex object name (SHA-1 or SHA-256).
pub fn is_object_name(revision: &str) -> bool {
    matches!(revision.len(), 40 | 64) && revision.bytes().all(|b| b.is_ascii_hexdigit())
}
