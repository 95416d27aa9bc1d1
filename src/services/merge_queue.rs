//! C7: integrates completed task branches into trunk one at a time. Lifecycle per
//! item: `pending -> rebasing -> testing -> merging -> pushing -> complete`, with
//! side exits to `conflict` and `test_failed`. The queue itself never holds more
//! than one item's worktree open at a time; everything else lives in
//! `merge-queue.json` via the Recovery Store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{info, instrument, warn};

use crate::domain::error::MergeQueueError;
use crate::domain::models::{
    CompletedStatus, MergeQueueConflictNote, MergeQueueItem, MergeStatus, MergeStrategy,
    ModelTier, OverlapSeverity,
};
use crate::domain::ports::{AgentInvoker, InvokeRequest, RateLimitTracker, RecoveryStore, ResultSubtype, VcsClient, Verifier, WorktreeManager};

const DOC_ONLY_EXTENSIONS: &[&str] = &["md", "txt", "rst"];
const CONFLICT_EXCERPT_FILES: usize = 3;
const CONFLICT_EXCERPT_CHARS: usize = 100;

pub struct MergeQueueRunConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub overlap_warning_files: u32,
    pub overlap_error_files: u32,
    pub trunk_branch: String,
}

pub struct MergeQueue {
    vcs: Arc<dyn VcsClient>,
    verifier: Arc<dyn Verifier>,
    invoker: Arc<dyn AgentInvoker>,
    rate_limit: Arc<dyn RateLimitTracker>,
    store: Arc<dyn RecoveryStore>,
    worktrees: Arc<dyn WorktreeManager>,
    repo: PathBuf,
    config: MergeQueueRunConfig,
}

impl MergeQueue {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vcs: Arc<dyn VcsClient>,
        verifier: Arc<dyn Verifier>,
        invoker: Arc<dyn AgentInvoker>,
        rate_limit: Arc<dyn RateLimitTracker>,
        store: Arc<dyn RecoveryStore>,
        worktrees: Arc<dyn WorktreeManager>,
        repo: PathBuf,
        config: MergeQueueRunConfig,
    ) -> Self {
        Self {
            vcs,
            verifier,
            invoker,
            rate_limit,
            store,
            worktrees,
            repo,
            config,
        }
    }

    /// Flag pending items whose modified files overlap another pending item's.
    /// Informational only: the queue still proceeds head-first.
    pub async fn scan_overlaps(&self) -> Result<Vec<MergeQueueConflictNote>, MergeQueueError> {
        let items = self.store.read_merge_queue().await?;
        let pending: Vec<&MergeQueueItem> = items
            .iter()
            .filter(|i| i.status == MergeStatus::Pending)
            .collect();

        let mut notes = Vec::new();
        for (idx, a) in pending.iter().enumerate() {
            for b in pending.iter().skip(idx + 1) {
                let overlap: Vec<String> = a
                    .modified_files
                    .iter()
                    .filter(|f| b.modified_files.contains(f))
                    .cloned()
                    .collect();
                if overlap.is_empty() {
                    continue;
                }
                let count = overlap.len() as u32;
                let severity = if count > self.config.overlap_error_files {
                    OverlapSeverity::Error
                } else {
                    OverlapSeverity::Warning
                };
                notes.push(MergeQueueConflictNote {
                    branch_a: a.branch.clone(),
                    branch_b: b.branch.clone(),
                    files: overlap,
                    severity,
                });
            }
        }
        for note in &notes {
            warn!(
                branch_a = %note.branch_a,
                branch_b = %note.branch_b,
                files = note.files.len(),
                severity = ?note.severity,
                "pre-merge overlap detected"
            );
        }
        Ok(notes)
    }

    /// Process the single earliest-queued ready item, if any. Items whose
    /// `next_retry_after` hasn't elapsed are skipped in favour of later-queued ones.
    #[instrument(skip(self))]
    pub async fn process_next(&self) -> Result<bool, MergeQueueError> {
        let _ = self.scan_overlaps().await;

        let mut items = self.store.read_merge_queue().await?;
        let now = Utc::now();
        let next_idx = items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == MergeStatus::Pending)
            .filter(|(_, i)| i.next_retry_after.is_none_or(|t| t <= now))
            .min_by_key(|(_, i)| i.queued_at)
            .map(|(idx, _)| idx);

        let Some(idx) = next_idx else {
            return Ok(false);
        };

        let mut item = items.remove(idx);
        let outcome = self.run_item(&mut item).await;
        if let Err(e) = &outcome {
            warn!(branch = %item.branch, error = %e, "merge queue item errored");
        }
        items.push(item);
        self.store.write_merge_queue(&items).await?;
        outcome.map(|()| true)
    }

    /// Drain the queue until no item is immediately ready, sleeping between polls
    /// so that backoff windows have a chance to elapse.
    pub async fn drain(&self, poll_interval_ms: u64) -> Result<(), MergeQueueError> {
        loop {
            let processed = self.process_next().await?;
            if !processed {
                let items = self.store.read_merge_queue().await?;
                let still_pending = items.iter().any(|i| i.status == MergeStatus::Pending);
                if !still_pending {
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_millis(poll_interval_ms)).await;
            }
        }
    }

    async fn run_item(&self, item: &mut MergeQueueItem) -> Result<(), MergeQueueError> {
        let worktree = self.worktrees.path_for(&item.task_id);

        item.status = MergeStatus::Rebasing;
        self.vcs.fetch(&self.repo).await?;
        match self.vcs.rebase(&worktree, &self.config.trunk_branch).await? {
            Ok(()) => {}
            Err(conflict_files) => {
                if !self.try_resolve_rebase_conflict(item, &worktree, &conflict_files).await? {
                    self.vcs.rebase_abort(&worktree).await.ok();
                    self.mark_conflict(item, conflict_files).await;
                    return Ok(());
                }
            }
        }

        item.status = MergeStatus::Testing;
        let mut verification = self.verifier.verify(&worktree).await.map_err(|_| MergeQueueError::TestFailed)?;
        if !verification.passed {
            self.attempt_fix(item, &worktree, &verification.feedback).await?;
            verification = self.verifier.verify(&worktree).await.map_err(|_| MergeQueueError::TestFailed)?;
            if !verification.passed {
                self.mark_test_failed(item).await;
                return Ok(());
            }
        }

        item.status = MergeStatus::Merging;
        let strategy = item.strategy_used.map(strategy_flag);
        match self.vcs.merge_no_ff(&self.repo, &item.branch, strategy).await? {
            Ok(()) => {}
            Err(conflict_files) => {
                if item.strategy_used.is_none() && all_doc_only(&conflict_files) {
                    item.strategy_used = Some(MergeStrategy::Theirs);
                    match self
                        .vcs
                        .merge_no_ff(&self.repo, &item.branch, Some(strategy_flag(MergeStrategy::Theirs)))
                        .await?
                    {
                        Ok(()) => {}
                        Err(conflict_files) => {
                            self.mark_conflict(item, conflict_files).await;
                            return Ok(());
                        }
                    }
                } else {
                    self.mark_conflict(item, conflict_files).await;
                    return Ok(());
                }
            }
        }
        let commit_sha = self.vcs.rev_parse_head(&self.repo).await.ok();

        item.status = MergeStatus::Pushing;
        self.vcs.push(&self.repo, &self.config.trunk_branch).await?;

        item.status = MergeStatus::Complete;
        item.completed_at = Some(Utc::now());
        item.duration_ms = Some(
            (Utc::now() - item.queued_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.mark_merged(&item.task_id, commit_sha).await;
        let _ = self.worktrees.release(&item.task_id, false).await;
        info!(branch = %item.branch, task_id = %item.task_id, "merged into trunk");
        Ok(())
    }

    /// Flip the task's own completed-state record from `complete` to `merged` now that
    /// its branch has landed in trunk.
    async fn mark_merged(&self, task_id: &str, commit_sha: Option<String>) {
        let Ok(mut completed) = self.store.list_completed().await else {
            return;
        };
        let Some(mut state) = completed.iter().position(|s| s.task_id == task_id).map(|i| completed.swap_remove(i)) else {
            return;
        };
        state.status = CompletedStatus::Merged;
        if commit_sha.is_some() {
            state.commit_sha = commit_sha;
        }
        let _ = self.store.complete_task(task_id, &state).await;
    }

    async fn try_resolve_rebase_conflict(
        &self,
        item: &mut MergeQueueItem,
        worktree: &Path,
        conflict_files: &[String],
    ) -> Result<bool, MergeQueueError> {
        let excerpt = build_conflict_excerpt(worktree, conflict_files).await;
        let prompt = format!(
            "The following files have unresolved rebase conflicts:\n{}\n\n{}\n\nResolve the conflicts, stage the result with `git add`, and run `git rebase --continue`.",
            conflict_files.join(", "),
            excerpt
        );
        self.invoke_single_turn(item, ModelTier::Opus, prompt, worktree.to_path_buf()).await?;
        self.vcs.rebase_continue(worktree).await.map_err(MergeQueueError::Vcs)
    }

    async fn attempt_fix(
        &self,
        item: &mut MergeQueueItem,
        worktree: &Path,
        feedback: &str,
    ) -> Result<(), MergeQueueError> {
        let prompt = format!(
            "Verification failed after rebasing onto trunk:\n{feedback}\n\nFix the issue and leave the working tree ready to re-verify."
        );
        self.invoke_single_turn(item, ModelTier::Sonnet, prompt, worktree.to_path_buf()).await
    }

    async fn invoke_single_turn(
        &self,
        item: &mut MergeQueueItem,
        model: ModelTier,
        prompt: String,
        cwd: PathBuf,
    ) -> Result<(), MergeQueueError> {
        let start = std::time::Instant::now();
        let mut stream = self
            .invoker
            .invoke(InvokeRequest {
                model,
                prompt,
                cwd,
                max_turns: Some(1),
            })
            .await?;

        let mut tokens = crate::domain::models::TokenUsage::default();
        while let Some(message) = stream.next().await {
            if let crate::domain::ports::AgentMessage::Result { subtype, tokens: used, .. } = message? {
                tokens = used;
                if subtype == ResultSubtype::Error {
                    break;
                }
            }
        }
        let _ = self
            .rate_limit
            .report_usage(&item.task_id, model, tokens, start.elapsed().as_millis() as u64)
            .await;
        Ok(())
    }

    async fn mark_conflict(&self, item: &mut MergeQueueItem, conflict_files: Vec<String>) {
        item.status = MergeStatus::Conflict;
        item.completed_at = Some(Utc::now());
        item.original_error.get_or_insert_with(|| format!("conflict in: {}", conflict_files.join(", ")));
        let _ = self.worktrees.release(&item.task_id, true).await;
        warn!(branch = %item.branch, "merge conflict, worktree preserved for inspection");
    }

    async fn mark_test_failed(&self, item: &mut MergeQueueItem) {
        item.original_error.get_or_insert_with(|| "re-verification failed after rebase".to_string());
        if item.retry_count < self.config.max_retries.min(item.max_retries) {
            item.retry_count += 1;
            item.is_retry = true;
            item.status = MergeStatus::Pending;
            item.next_retry_after = Some(Utc::now() + chrono::Duration::milliseconds(backoff_ms(
                item.retry_count,
                self.config.backoff_base_ms,
                self.config.backoff_cap_ms,
            ) as i64));
            info!(branch = %item.branch, retry_count = item.retry_count, "scheduling merge-queue retry");
        } else {
            item.status = MergeStatus::TestFailed;
            item.completed_at = Some(Utc::now());
            let _ = self.worktrees.release(&item.task_id, true).await;
        }
    }
}

fn strategy_flag(strategy: MergeStrategy) -> &'static str {
    match strategy {
        MergeStrategy::Theirs => "theirs",
        MergeStrategy::Ours => "ours",
        MergeStrategy::Default => "",
    }
}

fn all_doc_only(files: &[String]) -> bool {
    !files.is_empty()
        && files.iter().all(|f| {
            Path::new(f)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| DOC_ONLY_EXTENSIONS.contains(&ext))
        })
}

fn backoff_ms(retry_count: u32, base_ms: u64, cap_ms: u64) -> u64 {
    base_ms.saturating_mul(1u64 << retry_count.saturating_sub(1).min(16)).min(cap_ms)
}

async fn build_conflict_excerpt(worktree: &Path, files: &[String]) -> String {
    let mut sections = Vec::new();
    for file in files.iter().take(CONFLICT_EXCERPT_FILES) {
        if let Ok(content) = tokio::fs::read_to_string(worktree.join(file)).await {
            if let Some(marker_idx) = content.find("<<<<<<<") {
                let start = marker_idx.saturating_sub(CONFLICT_EXCERPT_CHARS / 2);
                let end = (marker_idx + CONFLICT_EXCERPT_CHARS / 2).min(content.len());
                let start = content
                    .char_indices()
                    .map(|(i, _)| i)
                    .find(|&i| i >= start)
                    .unwrap_or(0);
                let end = content
                    .char_indices()
                    .map(|(i, _)| i)
                    .rfind(|&i| i <= end)
                    .unwrap_or(content.len());
                sections.push(format!("--- {file} ---\n{}", &content[start..end]));
            }
        }
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{VcsError, VerifierError, WorktreeError, AgentInvokerError, RateLimitError};
    use crate::domain::models::{CompletedTaskState, TokenUsage, VerificationResult};
    use crate::domain::ports::{AcquiredWorktree, AgentMessage};
    use crate::infrastructure::recovery_store::FileRecoveryStore;
    use futures::stream::{self, BoxStream};
    use tempfile::tempdir;

    #[test]
    fn backoff_doubles_until_cap() {
        assert_eq!(backoff_ms(1, 1_000, 30_000), 1_000);
        assert_eq!(backoff_ms(2, 1_000, 30_000), 2_000);
        assert_eq!(backoff_ms(3, 1_000, 30_000), 4_000);
        assert_eq!(backoff_ms(10, 1_000, 30_000), 30_000);
    }

    #[test]
    fn doc_only_detects_markdown_and_text() {
        assert!(all_doc_only(&["README.md".to_string(), "notes.txt".to_string()]));
        assert!(!all_doc_only(&["src/lib.rs".to_string()]));
        assert!(!all_doc_only(&[]));
    }

    struct UnusedVcs;
    #[async_trait::async_trait]
    impl VcsClient for UnusedVcs {
        async fn rev_parse_head(&self, _repo: &Path) -> Result<String, VcsError> { unimplemented!() }
        async fn diff_name_only(&self, _repo: &Path, _base: &str) -> Result<Vec<String>, VcsError> { unimplemented!() }
        async fn diff_stat(&self, _repo: &Path, _base: &str) -> Result<(u32, u32), VcsError> { unimplemented!() }
        async fn add_all(&self, _repo: &Path) -> Result<(), VcsError> { unimplemented!() }
        async fn commit(&self, _repo: &Path, _message: &str) -> Result<String, VcsError> { unimplemented!() }
        async fn worktree_add(&self, _repo: &Path, _path: &Path, _branch: &str, _base: &str) -> Result<(), VcsError> { unimplemented!() }
        async fn worktree_remove(&self, _repo: &Path, _path: &Path) -> Result<(), VcsError> { unimplemented!() }
        async fn reset_hard_clean(&self, _worktree: &Path) -> Result<(), VcsError> { unimplemented!() }
        async fn fetch(&self, _repo: &Path) -> Result<(), VcsError> { unimplemented!() }
        async fn rebase(&self, _worktree: &Path, _onto: &str) -> Result<Result<(), Vec<String>>, VcsError> { unimplemented!() }
        async fn rebase_continue(&self, _worktree: &Path) -> Result<bool, VcsError> { unimplemented!() }
        async fn rebase_abort(&self, _worktree: &Path) -> Result<(), VcsError> { unimplemented!() }
        async fn merge_no_ff(&self, _repo: &Path, _branch: &str, _strategy: Option<&str>) -> Result<Result<(), Vec<String>>, VcsError> { unimplemented!() }
        async fn merge_tree_preview(&self, _repo: &Path, _a: &str, _b: &str) -> Result<Vec<String>, VcsError> { unimplemented!() }
        async fn push(&self, _repo: &Path, _branch: &str) -> Result<(), VcsError> { unimplemented!() }
        async fn branch_exists(&self, _repo: &Path, _branch: &str) -> Result<bool, VcsError> { unimplemented!() }
    }

    struct UnusedVerifier;
    #[async_trait::async_trait]
    impl Verifier for UnusedVerifier {
        async fn verify(&self, _worktree_path: &Path) -> Result<VerificationResult, VerifierError> { unimplemented!() }
    }

    struct UnusedInvoker;
    #[async_trait::async_trait]
    impl AgentInvoker for UnusedInvoker {
        async fn invoke(&self, _request: InvokeRequest) -> Result<BoxStream<'static, Result<AgentMessage, AgentInvokerError>>, AgentInvokerError> {
            Ok(stream::empty().boxed())
        }
    }

    struct UnusedRateLimit;
    #[async_trait::async_trait]
    impl RateLimitTracker for UnusedRateLimit {
        async fn report_usage(&self, _task_id: &str, _model: ModelTier, _tokens: TokenUsage, _duration_ms: u64) -> Result<(), RateLimitError> { unimplemented!() }
        async fn report_rate_limited(&self, _model: ModelTier, _retry_after_secs: Option<u64>) -> Result<(), RateLimitError> { unimplemented!() }
        async fn is_paused(&self, _model: ModelTier) -> Result<bool, RateLimitError> { Ok(false) }
        async fn check_auto_resume(&self) -> Result<(), RateLimitError> { Ok(()) }
        async fn snapshot(&self) -> Result<crate::domain::models::RateLimitState, RateLimitError> { unimplemented!() }
    }

    struct UnusedWorktrees;
    #[async_trait::async_trait]
    impl WorktreeManager for UnusedWorktrees {
        async fn acquire(&self, _task_id: &str, _base_branch: &str) -> Result<AcquiredWorktree, WorktreeError> { unimplemented!() }
        async fn release(&self, _task_id: &str, _preserve: bool) -> Result<(), WorktreeError> { Ok(()) }
        fn path_for(&self, _task_id: &str) -> PathBuf { PathBuf::from("/tmp") }
    }

    fn test_queue(store: Arc<dyn RecoveryStore>) -> MergeQueue {
        MergeQueue::new(
            Arc::new(UnusedVcs),
            Arc::new(UnusedVerifier),
            Arc::new(UnusedInvoker),
            Arc::new(UnusedRateLimit),
            store,
            Arc::new(UnusedWorktrees),
            PathBuf::from("/tmp/repo"),
            MergeQueueRunConfig {
                max_retries: 3,
                backoff_base_ms: 1_000,
                backoff_cap_ms: 30_000,
                overlap_warning_files: 2,
                overlap_error_files: 5,
                trunk_branch: "main".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn mark_merged_flips_completed_status_and_records_commit() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn RecoveryStore> = Arc::new(FileRecoveryStore::new(dir.path()));

        store
            .complete_task(
                "task-9",
                &CompletedTaskState {
                    task_id: "task-9".to_string(),
                    objective: "land the feature".to_string(),
                    status: CompletedStatus::Complete,
                    batch_id: "batch-1".to_string(),
                    completed_at: Utc::now(),
                    error: None,
                    modified_files: vec!["src/lib.rs".to_string()],
                    commit_sha: None,
                    last_updated: Utc::now(),
                },
            )
            .await
            .unwrap();

        let queue = test_queue(store.clone());
        queue.mark_merged("task-9", Some("abc123".to_string())).await;

        let completed = store.list_completed().await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, CompletedStatus::Merged);
        assert_eq!(completed[0].commit_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn mark_merged_is_a_noop_for_an_unknown_task() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn RecoveryStore> = Arc::new(FileRecoveryStore::new(dir.path()));
        let queue = test_queue(store.clone());

        queue.mark_merged("no-such-task", None).await;
        assert!(store.list_completed().await.unwrap().is_empty());
    }

    fn merge_item(branch: &str, files: &[&str]) -> MergeQueueItem {
        MergeQueueItem {
            branch: branch.to_string(),
            task_id: branch.to_string(),
            agent_id: branch.to_string(),
            status: MergeStatus::Pending,
            queued_at: Utc::now(),
            completed_at: None,
            modified_files: files.iter().map(|f| f.to_string()).collect(),
            retry_count: 0,
            max_retries: 3,
            next_retry_after: None,
            original_error: None,
            is_retry: false,
            strategy_used: None,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn small_overlaps_are_still_recorded_as_warnings() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn RecoveryStore> = Arc::new(FileRecoveryStore::new(dir.path()));
        store
            .write_merge_queue(&[
                merge_item("a", &["src/lib.rs"]),
                merge_item("b", &["src/lib.rs"]),
            ])
            .await
            .unwrap();

        let queue = test_queue(store);
        let notes = queue.scan_overlaps().await.unwrap();

        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, OverlapSeverity::Warning);
        assert_eq!(notes[0].files, vec!["src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn large_overlaps_are_recorded_as_errors() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn RecoveryStore> = Arc::new(FileRecoveryStore::new(dir.path()));
        let files = ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs", "f.rs"];
        store
            .write_merge_queue(&[merge_item("a", &files), merge_item("b", &files)])
            .await
            .unwrap();

        let queue = test_queue(store);
        let notes = queue.scan_overlaps().await.unwrap();

        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, OverlapSeverity::Error);
    }
}
