//! Repository setup and working-tree checkout through the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::models::build::CommitInfo;
use crate::models::repository::Repository;

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },
}

#[async_trait]
pub trait Checkout: Send + Sync {
    /// Create the local repository backing a newly registered `repo`.
    async fn init(&self, repo: &Repository) -> Result<(), CheckoutError>;

    /// Materialize `revision` of `repo` into `target` and describe the commit.
    async fn checkout(
        &self,
        repo: &Repository,
        revision: &str,
        ref_name: &str,
        target: &Path,
    ) -> Result<CommitInfo, CheckoutError>;
}

/// [`Checkout`] backed by bare repositories under `repos_dir`.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    repos_dir: PathBuf,
}

impl GitCheckout {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }
}

/// Run git with `args`, returning stdout on success.
async fn git(args: &[&str]) -> Result<String, CheckoutError> {
    let output = Command::new("git")
        .args(args)
        .stdin(Stdio::null())
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await?;

    if !output.status.success() {
        return Err(CheckoutError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn init(&self, repo: &Repository) -> Result<(), CheckoutError> {
        tokio::fs::create_dir_all(&self.repos_dir).await?;
        let local = path_arg(&repo.local_path(&self.repos_dir));
        match (&repo.url, repo.remote) {
            (Some(url), true) => {
                tracing::info!(repo = repo.id, url = %url, "Cloning remote repository");
                git(&["clone", "--bare", "--", url, &local]).await?;
            }
            _ => {
                tracing::info!(repo = repo.id, path = %local, "Initializing bare repository");
                git(&["init", "--bare", &local]).await?;
            }
        }
        Ok(())
    }

    async fn checkout(
        &self,
        repo: &Repository,
        revision: &str,
        ref_name: &str,
        target: &Path,
    ) -> Result<CommitInfo, CheckoutError> {
        let git_dir = path_arg(&repo.local_path(&self.repos_dir));

        if repo.remote {
            git(&["--git-dir", &git_dir, "fetch", "origin", "+refs/heads/*:refs/heads/*"])
                .await?;
        }

        tokio::fs::create_dir_all(target).await?;
        let work_tree = path_arg(target);
        git(&[
            "--git-dir",
            &git_dir,
            "--work-tree",
            &work_tree,
            "checkout",
            "-f",
            revision,
            "--",
            ".",
        ])
        .await?;

        let log = git(&[
            "--git-dir",
            &git_dir,
            "log",
            "-1",
            "--format=%an%x00%ae%x00%B",
            revision,
        ])
        .await?;

        let mut commit = parse_commit_log(&log);
        commit.revision = revision.to_string();
        commit.ref_name = ref_name.to_string();
        Ok(commit)
    }
}

/// Parse `%an%x00%ae%x00%B` output.
fn parse_commit_log(log: &str) -> CommitInfo {
    let mut fields = log.splitn(3, '\0');
    let author_name = fields.next().unwrap_or_default().trim().to_string();
    let author_email = fields.next().unwrap_or_default().trim().to_string();
    let message = fields.next().unwrap_or_default().trim().to_string();
    CommitInfo {
        author_name,
        author_email,
        message,
        ..Default::default()
    }
}
