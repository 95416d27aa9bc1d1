//! C2: isolated Git checkouts keyed by task id. On-disk layout is the source of truth —
//! there is no in-memory table of outstanding worktrees, so a crashed run is resumable by
//! simply re-reading `worktrees/` and `failed-worktrees/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::domain::error::WorktreeError;
use crate::domain::ports::{AcquiredWorktree, VcsClient, WorktreeManager};
use crate::infrastructure::recovery_store::atomic::{read_json, write_json_atomic};

const ADJECTIVES: &[&str] = &[
    "quiet", "brave", "lucky", "amber", "dusty", "swift", "bold", "calm", "eager", "grim",
    "hollow", "keen", "lush", "murky", "nimble", "odd", "proud", "rusty", "silent", "tidy",
];

const ANIMALS: &[&str] = &[
    "otter", "falcon", "badger", "heron", "lynx", "viper", "crow", "wolf", "ibex", "mole",
    "gecko", "tapir", "puffin", "marmot", "weasel", "ocelot", "civet", "newt", "shrike", "jackal",
];

/// FNV-1a over the task id, split into two halves to pick an adjective and an animal.
/// Deterministic: the same task id always yields the same branch, across retries and restarts.
fn seeded_branch_name(task_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in task_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    let adjective = ADJECTIVES[(hash as usize) % ADJECTIVES.len()];
    let animal = ANIMALS[((hash >> 32) as usize) % ANIMALS.len()];
    format!("undercity/{adjective}-{animal}/{task_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeMeta {
    pub task_id: String,
    pub branch: String,
    pub acquired_at: DateTime<Utc>,
    pub preserved_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub struct GitWorktreeManager {
    repo: PathBuf,
    worktree_root: PathBuf,
    failed_root: PathBuf,
    vcs: Arc<dyn VcsClient>,
    max_preserved: u32,
}

impl GitWorktreeManager {
    #[must_use]
    pub fn new(
        repo: PathBuf,
        worktree_root: PathBuf,
        failed_root: PathBuf,
        vcs: Arc<dyn VcsClient>,
        max_preserved: u32,
    ) -> Self {
        Self {
            repo,
            worktree_root,
            failed_root,
            vcs,
            max_preserved,
        }
    }

    fn meta_path(&self, task_id: &str) -> PathBuf {
        self.worktree_root.join(format!("{task_id}.meta.json"))
    }

    fn failed_meta_path(&self, task_id: &str) -> PathBuf {
        self.failed_root.join(format!("{task_id}.meta.json"))
    }

    /// Record a failure reason against an already-acquired worktree, consulted by
    /// `release` when `preserve` is true. Optional: callers that don't have an error
    /// string (e.g. a plain preserve-for-inspection) may skip this.
    pub async fn record_failure(&self, task_id: &str, error: &str) -> Result<(), WorktreeError> {
        let path = self.meta_path(task_id);
        let mut meta: WorktreeMeta = read_json(&path)
            .await
            .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))?
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;
        meta.error = Some(error.to_string());
        write_json_atomic(&path, &meta)
            .await
            .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))
    }

    async fn prune_failed(&self) -> Result<(), WorktreeError> {
        self.prune().await.map(|_| ())
    }

    async fn read_metas(dir: &PathBuf) -> Result<Vec<WorktreeMeta>, WorktreeError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WorktreeError::Io(e)),
        };
        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(meta) = read_json::<WorktreeMeta>(&path)
                    .await
                    .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))?
                {
                    metas.push(meta);
                }
            }
        }
        Ok(metas)
    }

    /// Worktrees currently checked out and in use by a task.
    pub async fn list_active(&self) -> Result<Vec<WorktreeMeta>, WorktreeError> {
        Self::read_metas(&self.worktree_root).await
    }

    /// Worktrees preserved for inspection after a conflict or terminal failure.
    pub async fn list_preserved(&self) -> Result<Vec<WorktreeMeta>, WorktreeError> {
        Self::read_metas(&self.failed_root).await
    }

    /// Delete the oldest preserved worktrees past `max_preserved`, returning the count removed.
    pub async fn prune(&self) -> Result<usize, WorktreeError> {
        let mut metas = Self::read_metas(&self.failed_root).await?;
        metas.sort_by_key(|m| m.preserved_at.unwrap_or(m.acquired_at));
        let excess = metas.len().saturating_sub(self.max_preserved as usize);
        for meta in metas.into_iter().take(excess) {
            warn!(task_id = %meta.task_id, "pruning oldest preserved worktree");
            let _ = tokio::fs::remove_dir_all(self.failed_root.join(&meta.task_id)).await;
            let _ = tokio::fs::remove_file(self.failed_meta_path(&meta.task_id)).await;
        }
        Ok(excess)
    }
}

#[async_trait]
impl WorktreeManager for GitWorktreeManager {
    #[instrument(skip(self))]
    async fn acquire(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<AcquiredWorktree, WorktreeError> {
        let path = self.path_for(task_id);
        let branch = seeded_branch_name(task_id);

        if path.exists() {
            let meta: Option<WorktreeMeta> = read_json(&self.meta_path(task_id))
                .await
                .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))?;
            return match meta {
                Some(meta) if meta.branch == branch => {
                    info!(task_id, branch = %branch, path = %path.display(), "reusing worktree from prior run");
                    Ok(AcquiredWorktree { path, branch })
                }
                _ => Err(WorktreeError::AlreadyExists(task_id.to_string())),
            };
        }

        self.vcs
            .worktree_add(&self.repo, &path, &branch, base_branch)
            .await
            .map_err(|e| WorktreeError::Git(e.to_string()))?;

        let meta = WorktreeMeta {
            task_id: task_id.to_string(),
            branch: branch.clone(),
            acquired_at: Utc::now(),
            preserved_at: None,
            error: None,
        };
        write_json_atomic(&self.meta_path(task_id), &meta)
            .await
            .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))?;

        info!(task_id, branch = %branch, path = %path.display(), "acquired worktree");
        Ok(AcquiredWorktree { path, branch })
    }

    #[instrument(skip(self))]
    async fn release(&self, task_id: &str, preserve: bool) -> Result<(), WorktreeError> {
        let path = self.path_for(task_id);
        let meta_path = self.meta_path(task_id);
        let meta: Option<WorktreeMeta> = read_json(&meta_path)
            .await
            .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))?;

        if preserve {
            let mut meta = meta.unwrap_or(WorktreeMeta {
                task_id: task_id.to_string(),
                branch: seeded_branch_name(task_id),
                acquired_at: Utc::now(),
                preserved_at: None,
                error: None,
            });
            meta.preserved_at = Some(Utc::now());

            tokio::fs::create_dir_all(&self.failed_root).await?;
            if path.exists() {
                tokio::fs::rename(&path, self.failed_root.join(task_id)).await?;
            }
            write_json_atomic(&self.failed_meta_path(task_id), &meta)
                .await
                .map_err(|e| WorktreeError::Io(std::io::Error::other(e.to_string())))?;
            let _ = tokio::fs::remove_file(&meta_path).await;

            warn!(task_id, "preserved failed worktree");
            self.prune_failed().await?;
        } else {
            if path.exists() {
                self.vcs
                    .worktree_remove(&self.repo, &path)
                    .await
                    .map_err(|e| WorktreeError::Git(e.to_string()))?;
            }
            let _ = tokio::fs::remove_file(&meta_path).await;
            info!(task_id, "released worktree");
        }
        Ok(())
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.worktree_root.join(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_deterministic() {
        let a = seeded_branch_name("task-123");
        let b = seeded_branch_name("task-123");
        assert_eq!(a, b);
        assert!(a.starts_with("undercity/"));
        assert!(a.ends_with("/task-123"));
    }

    #[test]
    fn different_tasks_usually_differ() {
        let a = seeded_branch_name("task-1");
        let b = seeded_branch_name("task-2");
        assert_ne!(a, b);
    }
}
