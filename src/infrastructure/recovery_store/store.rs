//! `FileRecoveryStore`: the on-disk layout described by the data model, backed by the
//! atomic primitives in [`super::atomic`].

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::instrument;

use super::atomic::{read_json, with_file_lock, write_json_atomic};
use crate::domain::error::RecoveryStoreError;
use crate::domain::models::{
    ActiveTaskState, BatchMetadata, CompletedTaskState, MergeQueueItem, QueuedTask, RateLimitState,
    ScoutCacheEntry,
};
use crate::domain::ports::RecoveryStore;

pub struct FileRecoveryStore {
    root: PathBuf,
}

impl FileRecoveryStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn batch_meta_path(&self) -> PathBuf {
        self.root.join("batch-meta.json")
    }

    fn active_path(&self, task_id: &str) -> PathBuf {
        self.root.join("active").join(format!("{task_id}.state"))
    }

    fn completed_path(&self, task_id: &str) -> PathBuf {
        self.root.join("completed").join(format!("{task_id}.done"))
    }

    fn rate_limit_path(&self) -> PathBuf {
        self.root.join("rate-limit.json")
    }

    fn merge_queue_path(&self) -> PathBuf {
        self.root.join("merge-queue.json")
    }

    fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    fn scout_cache_path(&self) -> PathBuf {
        self.root.join("scout-cache.json")
    }

    async fn list_dir_json<T: serde::de::DeserializeOwned>(
        dir: &Path,
    ) -> Result<Vec<T>, RecoveryStoreError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(RecoveryStoreError::Io {
                    path: dir.display().to_string(),
                    source: e,
                })
            }
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| RecoveryStoreError::Io {
            path: dir.display().to_string(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().is_some() {
                if let Some(value) = read_json::<T>(&path).await? {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RecoveryStore for FileRecoveryStore {
    async fn write_batch_metadata(&self, meta: &BatchMetadata) -> Result<(), RecoveryStoreError> {
        let mut meta = meta.clone();
        meta.last_updated = Utc::now();
        write_json_atomic(&self.batch_meta_path(), &meta).await
    }

    async fn read_batch_metadata(&self) -> Result<Option<BatchMetadata>, RecoveryStoreError> {
        read_json(&self.batch_meta_path()).await
    }

    #[instrument(skip(self, state), fields(task_id = %state.task_id))]
    async fn write_active(&self, state: &ActiveTaskState) -> Result<(), RecoveryStoreError> {
        let mut state = state.clone();
        state.last_updated = Utc::now();
        write_json_atomic(&self.active_path(&state.task_id), &state).await
    }

    async fn read_active(&self, task_id: &str) -> Result<Option<ActiveTaskState>, RecoveryStoreError> {
        read_json(&self.active_path(task_id)).await
    }

    async fn list_active(&self) -> Result<Vec<ActiveTaskState>, RecoveryStoreError> {
        Self::list_dir_json(&self.root.join("active")).await
    }

    #[instrument(skip(self, state), fields(task_id = %task_id))]
    async fn complete_task(
        &self,
        task_id: &str,
        state: &CompletedTaskState,
    ) -> Result<(), RecoveryStoreError> {
        let mut state = state.clone();
        state.last_updated = Utc::now();
        let completed_path = self.completed_path(task_id);
        write_json_atomic(&completed_path, &state).await?;
        let active_path = self.active_path(task_id);
        if active_path.exists() {
            let _ = tokio::fs::remove_file(&active_path).await;
        }
        Ok(())
    }

    async fn list_completed(&self) -> Result<Vec<CompletedTaskState>, RecoveryStoreError> {
        Self::list_dir_json(&self.root.join("completed")).await
    }

    async fn write_rate_limit_state(&self, state: &RateLimitState) -> Result<(), RecoveryStoreError> {
        let path = self.rate_limit_path();
        let mut state = state.clone();
        with_file_lock(&path, 5, || async move {
            state.last_updated = Utc::now();
            write_json_atomic(&path, &state).await
        })
        .await
    }

    async fn read_rate_limit_state(&self) -> Result<RateLimitState, RecoveryStoreError> {
        Ok(read_json(&self.rate_limit_path()).await?.unwrap_or_default())
    }

    async fn write_merge_queue(&self, items: &[MergeQueueItem]) -> Result<(), RecoveryStoreError> {
        let path = self.merge_queue_path();
        let items = items.to_vec();
        with_file_lock(&path, 5, || async move { write_json_atomic(&path, &items).await }).await
    }

    async fn read_merge_queue(&self) -> Result<Vec<MergeQueueItem>, RecoveryStoreError> {
        Ok(read_json(&self.merge_queue_path()).await?.unwrap_or_default())
    }

    async fn write_queue(&self, tasks: &[QueuedTask]) -> Result<(), RecoveryStoreError> {
        let path = self.queue_path();
        let tasks = tasks.to_vec();
        with_file_lock(&path, 5, || async move { write_json_atomic(&path, &tasks).await }).await
    }

    async fn read_queue(&self) -> Result<Vec<QueuedTask>, RecoveryStoreError> {
        Ok(read_json(&self.queue_path()).await?.unwrap_or_default())
    }

    async fn write_scout_cache(&self, entries: &[ScoutCacheEntry]) -> Result<(), RecoveryStoreError> {
        let path = self.scout_cache_path();
        let entries = entries.to_vec();
        with_file_lock(&path, 5, || async move { write_json_atomic(&path, &entries).await }).await
    }

    async fn read_scout_cache(&self) -> Result<Vec<ScoutCacheEntry>, RecoveryStoreError> {
        Ok(read_json(&self.scout_cache_path()).await?.unwrap_or_default())
    }

    fn worktree_root(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    fn failed_worktree_root(&self) -> PathBuf {
        self.root.join("failed-worktrees")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ActiveStatus, CompletedStatus};
    use tempfile::TempDir;

    fn active(task_id: &str, batch_id: &str) -> ActiveTaskState {
        ActiveTaskState {
            task_id: task_id.to_string(),
            objective: "do the thing".to_string(),
            worktree_path: PathBuf::from("/tmp/wt"),
            branch: "undercity/quiet-otter/t1".to_string(),
            status: ActiveStatus::Running,
            batch_id: batch_id.to_string(),
            started_at: Some(Utc::now()),
            previous_checkpoint: None,
            pid: Some(std::process::id()),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn active_task_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(dir.path());
        store.write_active(&active("t1", "b1")).await.unwrap();
        let read = store.read_active("t1").await.unwrap().unwrap();
        assert_eq!(read.task_id, "t1");
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_task_removes_from_active() {
        let dir = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(dir.path());
        store.write_active(&active("t1", "b1")).await.unwrap();

        let completed = CompletedTaskState {
            task_id: "t1".to_string(),
            objective: "do the thing".to_string(),
            status: CompletedStatus::Complete,
            batch_id: "b1".to_string(),
            completed_at: Utc::now(),
            error: None,
            modified_files: vec!["src/lib.rs".to_string()],
            commit_sha: Some("deadbeef".to_string()),
            last_updated: Utc::now(),
        };
        store.complete_task("t1", &completed).await.unwrap();

        assert!(store.read_active("t1").await.unwrap().is_none());
        assert_eq!(store.list_completed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_state_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(dir.path());
        let state = store.read_rate_limit_state().await.unwrap();
        assert!(state.tasks.is_empty());
    }
}
