//! Repository checkout management via the git CLI.
//!
//! Each repository gets a directory under the workspace root keyed by its
//! id. First contact is a shallow clone; later runs fetch and hard-reset
//! to the remote branch, falling back to a fast-forward pull when the
//! remote ref cannot be resolved.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

const DEFAULT_BRANCH: &str = "main";

/// Trait for obtaining a local checkout, mockable in tests.
#[async_trait]
pub trait BaseCheckout: Send + Sync {
    /// Ensure an up-to-date checkout exists and return its path.
    async fn ensure_checkout(
        &self,
        repository_id: &str,
        repo_url: &str,
        default_branch: Option<&str>,
    ) -> Result<PathBuf>;
}

/// Checkout implementation using the git CLI.
pub struct GitCheckout {
    workspace_root: PathBuf,
}

impl GitCheckout {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }
}

#[async_trait]
impl BaseCheckout for GitCheckout {
    async fn ensure_checkout(
        &self,
        repository_id: &str,
        repo_url: &str,
        default_branch: Option<&str>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.workspace_root)
            .await
            .with_context(|| {
                format!(
                    "failed to create workspace root {}",
                    self.workspace_root.display()
                )
            })?;

        let branch = default_branch.unwrap_or(DEFAULT_BRANCH);
        let checkout_dir = self.workspace_root.join(repository_id);

        if !checkout_dir.exists() {
            info!(
                repository_id = %repository_id,
                branch = %branch,
                "cloning repository"
            );
            run_git(
                &self.workspace_root,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    branch,
                    repo_url,
                    repository_id,
                ],
            )
            .await?;
            return Ok(checkout_dir);
        }

        run_git(&checkout_dir, &["fetch", "--all", "--prune"]).await?;

        let remote_ref = format!("origin/{branch}");
        if run_git(&checkout_dir, &["rev-parse", "--verify", &remote_ref])
            .await
            .is_ok()
        {
            run_git(&checkout_dir, &["reset", "--hard", &remote_ref]).await?;
        } else {
            run_git(&checkout_dir, &["pull", "--ff-only"]).await?;
        }

        debug!(repository_id = %repository_id, path = %checkout_dir.display(), "checkout refreshed");
        Ok(checkout_dir)
    }
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .context("failed to spawn git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_git_commands_surface_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_git(dir.path(), &["rev-parse", "--verify", "origin/main"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("git rev-parse --verify origin/main failed"));
    }

    #[tokio::test]
    async fn successful_git_commands_return_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let version = run_git(dir.path(), &["--version"]).await.unwrap();
        assert!(version.starts_with("git version"));
    }
}
