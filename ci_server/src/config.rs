//! CI runner configuration — loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// Parent directory of per-build working trees.
    pub workspace_dir: PathBuf,
    /// Directory holding the managed bare repositories.
    pub repos_dir: PathBuf,
    /// JSON persistence file.
    pub data_file: PathBuf,
    /// Shared secret for hook HMAC validation; empty disables validation.
    pub hook_secret: String,
    /// Build script name, relative to the checked-out tree.
    pub build_script: PathBuf,
    /// How long to wait for build output pipes to close after the script exits.
    pub output_drain: Duration,
    /// Keep working trees after builds finish.
    pub keep_workspaces: bool,
}

impl CiConfig {
    pub fn from_env() -> Self {
        let workspace_dir = std::env::var("SEA_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./tmp"));
        let repos_dir = std::env::var("SEA_REPOS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./repos"));
        let data_file = std::env::var("SEA_DATA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sea.json"));
        let hook_secret = std::env::var("SEA_HOOK_SECRET").unwrap_or_default();
        let build_script = std::env::var("SEA_BUILD_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("Seafile"));
        let output_drain_secs = std::env::var("SEA_OUTPUT_DRAIN_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);
        let keep_workspaces = std::env::var("SEA_KEEP_WORKSPACES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        if hook_secret.is_empty() {
            tracing::warn!("SEA_HOOK_SECRET not set -- hook signature validation disabled");
        }

        Self {
            workspace_dir,
            repos_dir,
            data_file,
            hook_secret,
            build_script,
            output_drain: Duration::from_secs(output_drain_secs),
            keep_workspaces,
        }
    }

    /// Create the working directories and make them absolute, so hook paths
    /// can be matched against repository locations.
    pub fn prepare_dirs(&mut self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.workspace_dir)?;
        std::fs::create_dir_all(&self.repos_dir)?;
        self.workspace_dir = std::fs::canonicalize(&self.workspace_dir)?;
        self.repos_dir = std::fs::canonicalize(&self.repos_dir)?;
        Ok(())
    }

    /// Configuration rooted in `root`, for tests and embedding.
    pub fn rooted(root: &std::path::Path) -> Self {
        Self {
            workspace_dir: root.join("tmp"),
            repos_dir: root.join("repos"),
            data_file: root.join("sea.json"),
            hook_secret: String::new(),
            build_script: PathBuf::from("Seafile"),
            output_drain: Duration::from_secs(5),
            keep_workspaces: false,
        }
    }
}
