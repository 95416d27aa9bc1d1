//! `git`-subprocess backed implementation of [`crate::domain::ports::VcsClient`].

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::domain::error::VcsError;
use crate::domain::ports::VcsClient;

/// Reject branch names that could be interpreted as command flags or escape the
/// intended ref namespace when interpolated into a `git` invocation.
pub fn validate_branch_name(name: &str) -> Result<(), VcsError> {
    if name.is_empty() {
        return Err(VcsError::InvalidBranchName("empty branch name".into()));
    }
    if name.starts_with('-') {
        return Err(VcsError::InvalidBranchName(format!(
            "branch name `{name}` looks like a flag"
        )));
    }
    if name.contains("..") || name.contains(' ') || name.contains('~') || name.contains('^')
        || name.contains(':') || name.contains('?') || name.contains('*') || name.contains('[')
    {
        return Err(VcsError::InvalidBranchName(format!(
            "branch name `{name}` contains disallowed characters"
        )));
    }
    if name.ends_with(".lock") || name.ends_with('/') || name.ends_with('.') {
        return Err(VcsError::InvalidBranchName(format!(
            "branch name `{name}` has a disallowed suffix"
        )));
    }
    if name.split('/').any(str::is_empty) {
        return Err(VcsError::InvalidBranchName(format!(
            "branch name `{name}` has an empty path component"
        )));
    }
    Ok(())
}

pub struct GitClient;

impl GitClient {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
        debug!(args = ?args, cwd = %cwd.display(), "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(VcsError::CommandFailed {
                args: args.join(" "),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn conflicted_files(porcelain: &str) -> Vec<String> {
        porcelain
            .lines()
            .filter_map(|line| {
                let code = line.get(0..2)?;
                matches!(code, "UU" | "AA" | "UD" | "DU" | "AU" | "DD")
                    .then(|| line.get(3..).unwrap_or_default().to_string())
            })
            .collect()
    }
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsClient for GitClient {
    #[instrument(skip(self))]
    async fn rev_parse_head(&self, repo: &Path) -> Result<String, VcsError> {
        self.run(repo, &["rev-parse", "HEAD"]).await
    }

    async fn diff_name_only(&self, repo: &Path, base: &str) -> Result<Vec<String>, VcsError> {
        let out = self.run(repo, &["diff", "--name-only", base]).await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    async fn diff_stat(&self, repo: &Path, base: &str) -> Result<(u32, u32), VcsError> {
        let files = self.diff_name_only(repo, base).await?;
        let out = self.run(repo, &["diff", "--shortstat", base]).await?;
        let lines = out
            .split(',')
            .filter_map(|part| {
                let part = part.trim();
                part.split_whitespace().next()?.parse::<u32>().ok()
            })
            .sum();
        Ok((files.len() as u32, lines))
    }

    async fn add_all(&self, repo: &Path) -> Result<(), VcsError> {
        self.run(repo, &["add", "-A"]).await.map(|_| ())
    }

    async fn commit(&self, repo: &Path, message: &str) -> Result<String, VcsError> {
        self.run(repo, &["commit", "--no-verify", "-m", message]).await?;
        self.rev_parse_head(repo).await
    }

    #[instrument(skip(self))]
    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), VcsError> {
        validate_branch_name(branch)?;
        self.run(
            repo,
            &[
                "worktree",
                "add",
                "-b",
                branch,
                &path.to_string_lossy(),
                base,
            ],
        )
        .await
        .map(|_| ())
    }

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<(), VcsError> {
        self.run(
            repo,
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        )
        .await
        .map(|_| ())
    }

    async fn reset_hard_clean(&self, worktree: &Path) -> Result<(), VcsError> {
        self.run(worktree, &["reset", "--hard"]).await?;
        self.run(worktree, &["clean", "-fd"]).await.map(|_| ())
    }

    async fn fetch(&self, repo: &Path) -> Result<(), VcsError> {
        self.run(repo, &["fetch"]).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn rebase(&self, worktree: &Path, onto: &str) -> Result<Result<(), Vec<String>>, VcsError> {
        match self.run(worktree, &["rebase", onto]).await {
            Ok(_) => Ok(Ok(())),
            Err(VcsError::CommandFailed { stderr, .. }) => {
                let status = self.run(worktree, &["status", "--porcelain"]).await?;
                let conflicts = Self::conflicted_files(&status);
                if conflicts.is_empty() {
                    Err(VcsError::CommandFailed {
                        args: format!("rebase {onto}"),
                        status: None,
                        stderr,
                    })
                } else {
                    Ok(Err(conflicts))
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn rebase_continue(&self, worktree: &Path) -> Result<bool, VcsError> {
        match self.run(worktree, &["rebase", "--continue"]).await {
            Ok(_) => Ok(true),
            Err(_) => {
                let status = self.run(worktree, &["status", "--porcelain"]).await?;
                Ok(Self::conflicted_files(&status).is_empty())
            }
        }
    }

    async fn rebase_abort(&self, worktree: &Path) -> Result<(), VcsError> {
        warn!(worktree = %worktree.display(), "aborting rebase");
        self.run(worktree, &["rebase", "--abort"]).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn merge_no_ff(
        &self,
        repo: &Path,
        branch: &str,
        strategy: Option<&str>,
    ) -> Result<Result<(), Vec<String>>, VcsError> {
        validate_branch_name(branch)?;
        let mut args = vec!["merge", "--no-ff", "-m"];
        let message = format!("Merge {branch}");
        args.push(&message);
        if let Some(strategy) = strategy {
            args.push("-X");
            args.push(strategy);
        }
        args.push(branch);

        match self.run(repo, &args).await {
            Ok(_) => Ok(Ok(())),
            Err(VcsError::CommandFailed { stderr, .. }) => {
                let status = self.run(repo, &["status", "--porcelain"]).await?;
                let conflicts = Self::conflicted_files(&status);
                let _ = self.run(repo, &["merge", "--abort"]).await;
                if conflicts.is_empty() {
                    Err(VcsError::CommandFailed {
                        args: format!("merge {branch}"),
                        status: None,
                        stderr,
                    })
                } else {
                    Ok(Err(conflicts))
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn merge_tree_preview(
        &self,
        repo: &Path,
        branch_a: &str,
        branch_b: &str,
    ) -> Result<Vec<String>, VcsError> {
        validate_branch_name(branch_a)?;
        validate_branch_name(branch_b)?;
        let out = self
            .run(repo, &["merge-tree", branch_a, branch_b])
            .await
            .unwrap_or_default();
        Ok(out
            .lines()
            .filter(|l| l.starts_with("<<<<<<<") || l.contains("CONFLICT"))
            .map(str::to_string)
            .collect())
    }

    async fn push(&self, repo: &Path, branch: &str) -> Result<(), VcsError> {
        validate_branch_name(branch)?;
        self.run(repo, &["push", "origin", branch]).await.map(|_| ())
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, VcsError> {
        validate_branch_name(branch)?;
        let ref_name = format!("refs/heads/{branch}");
        Ok(self
            .run(repo, &["show-ref", "--verify", "--quiet", &ref_name])
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_flag_like_names() {
        assert!(validate_branch_name("-rf").is_err());
    }

    #[test]
    fn rejects_dotdot() {
        assert!(validate_branch_name("feature/../escape").is_err());
    }

    #[test]
    fn rejects_lock_suffix() {
        assert!(validate_branch_name("feature.lock").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_branch_name("").is_err());
    }

    #[test]
    fn accepts_normal_branch() {
        assert!(validate_branch_name("undercity/quiet-otter/task-1").is_ok());
    }

    #[test]
    fn conflicted_files_parses_porcelain() {
        let porcelain = "UU src/main.rs\nM  src/lib.rs\nAA Cargo.toml\n";
        let files = GitClient::conflicted_files(porcelain);
        assert_eq!(files, vec!["src/main.rs".to_string(), "Cargo.toml".to_string()]);
    }
}
