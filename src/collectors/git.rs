//! Local clone of the advisory repository, kept in sync with `git`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

/// A checkout at `path` that tracks `branch` of `remote`
#[derive(Debug, Clone)]
pub struct GitCheckout {
    path: PathBuf,
    remote: String,
    branch: String,
}

impl GitCheckout {
    pub fn new(path: PathBuf, remote: String, branch: String) -> Self {
        Self { path, remote, branch }
    }

    /// Clone on first use, otherwise fetch, check out and fast-forward the branch
    pub async fn sync(&self) -> Result<()> {
        if !self.path.is_dir() {
            tracing::info!(remote = %self.remote, path = %self.path.display(), branch = %self.branch, "Cloning advisory repository");
            let path = self.path.to_string_lossy();
            git(None, &["clone", "--branch", &self.branch, &self.remote, &path])
                .await
                .with_context(|| format!("Failed to clone {}", self.remote))?;
            return Ok(());
        }

        tracing::info!(path = %self.path.display(), branch = %self.branch, "Updating advisory repository");
        git(Some(&self.path), &["fetch", "origin", &self.branch])
            .await
            .context("Failed to fetch advisory repository")?;
        git(Some(&self.path), &["checkout", &self.branch])
            .await
            .with_context(|| format!("Failed to check out {}", self.branch))?;
        git(Some(&self.path), &["pull", "--ff-only", "origin", &self.branch])
            .await
            .context("Failed to pull advisory repository")?;
        Ok(())
    }

    /// Commit currently checked out
    pub async fn head(&self) -> Result<String> {
        git(Some(&self.path), &["rev-parse", "HEAD"])
            .await
            .context("Failed to read checkout HEAD")
    }

    /// Browsable base for blob links, e.g. `https://github.com/org/repo`
    pub fn web_url(&self) -> &str {
        let remote = self.remote.trim_end_matches('/');
        remote.strip_suffix(".git").unwrap_or(remote)
    }

    /// Link to `rel_path` as of `commit`
    pub fn blob_url(&self, commit: &str, rel_path: &str) -> String {
        format!("{}/blob/{}/{}", self.web_url(), commit, rel_path)
    }
}

async fn git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    let output = cmd
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to run git")?;

    if !output.status.success() {
        anyhow::bail!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_url_strips_git_suffix() {
        let checkout = GitCheckout::new(
            PathBuf::from("/tmp/osv"),
            "https://github.com/ossf/malicious-packages.git".to_string(),
            "main".to_string(),
        );
        assert_eq!(
            checkout.blob_url("0123abcd", "osv/malicious/npm/x/MAL-1.json"),
            "https://github.com/ossf/malicious-packages/blob/0123abcd/osv/malicious/npm/x/MAL-1.json"
        );
    }

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = git(Some(dir.path()), &["rev-parse", "HEAD"]).await.unwrap_err();
        assert!(err.to_string().contains("git rev-parse HEAD"));
    }
}
