//! Trait boundaries (hexagonal "ports") between the services layer and infrastructure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{
    AgentInvokerError, RateLimitError, RecoveryStoreError, VcsError, VerifierError, WorktreeError,
};
use super::models::{
    ActiveTaskState, BatchMetadata, CompletedTaskState, MergeQueueItem, ModelTier, QueuedTask,
    RateLimitState, ScoutCacheEntry, TokenUsage, VerificationResult,
};

/// C1 — translates the project's own quality signals into a structured verdict.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, worktree_path: &Path) -> Result<VerificationResult, VerifierError>;
}

/// A freshly acquired, isolated checkout.
#[derive(Debug, Clone)]
pub struct AcquiredWorktree {
    pub path: PathBuf,
    pub branch: String,
}

/// C2 — creates, tracks, and releases isolated Git checkouts keyed by task id.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn acquire(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<AcquiredWorktree, WorktreeError>;

    async fn release(&self, task_id: &str, preserve: bool) -> Result<(), WorktreeError>;

    /// Path a previously acquired worktree would live at, without creating it.
    /// Used by startup reconciliation to check invariant 2 of the data model.
    fn path_for(&self, task_id: &str) -> PathBuf;
}

/// C3 — tracks token usage across sliding windows and exposes pause state.
#[async_trait]
pub trait RateLimitTracker: Send + Sync {
    /// Record a completed invocation's usage and fold it into both sliding windows.
    async fn report_usage(
        &self,
        task_id: &str,
        model: ModelTier,
        tokens: TokenUsage,
        duration_ms: u64,
    ) -> Result<(), RateLimitError>;

    /// Record an observed 429, applying `Retry-After` if present.
    async fn report_rate_limited(
        &self,
        model: ModelTier,
        retry_after_secs: Option<u64>,
    ) -> Result<(), RateLimitError>;

    /// Whether the given model tier is currently paused.
    async fn is_paused(&self, model: ModelTier) -> Result<bool, RateLimitError>;

    /// Re-evaluate pause state against the current time and hysteresis rule,
    /// lifting pauses whose resume condition has been met.
    async fn check_auto_resume(&self) -> Result<(), RateLimitError>;

    async fn snapshot(&self) -> Result<RateLimitState, RateLimitError>;
}

/// Tagged union of streamed agent messages, mirroring the transport's own framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Progress { detail: String },
    ToolUse { name: String },
    ContentBlock { text: String },
    Result {
        subtype: ResultSubtype,
        text: String,
        tokens: TokenUsage,
    },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model: ModelTier,
    pub prompt: String,
    pub cwd: PathBuf,
    pub max_turns: Option<u32>,
}

/// C4 — single call to the LLM with a constructed prompt; yields a stream of messages.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: InvokeRequest,
    ) -> Result<BoxStream<'static, Result<AgentMessage, AgentInvokerError>>, AgentInvokerError>;
}

/// C8 — atomic on-disk representation of all mutable engine state.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn write_batch_metadata(&self, meta: &BatchMetadata) -> Result<(), RecoveryStoreError>;
    async fn read_batch_metadata(&self) -> Result<Option<BatchMetadata>, RecoveryStoreError>;

    async fn write_active(&self, state: &ActiveTaskState) -> Result<(), RecoveryStoreError>;
    async fn read_active(&self, task_id: &str) -> Result<Option<ActiveTaskState>, RecoveryStoreError>;
    async fn list_active(&self) -> Result<Vec<ActiveTaskState>, RecoveryStoreError>;

    /// Atomically move `active/<task_id>` to `completed/<task_id>`, writing `state`.
    async fn complete_task(
        &self,
        task_id: &str,
        state: &CompletedTaskState,
    ) -> Result<(), RecoveryStoreError>;

    async fn list_completed(&self) -> Result<Vec<CompletedTaskState>, RecoveryStoreError>;

    async fn write_rate_limit_state(&self, state: &RateLimitState) -> Result<(), RecoveryStoreError>;
    async fn read_rate_limit_state(&self) -> Result<RateLimitState, RecoveryStoreError>;

    async fn write_merge_queue(&self, items: &[MergeQueueItem]) -> Result<(), RecoveryStoreError>;
    async fn read_merge_queue(&self) -> Result<Vec<MergeQueueItem>, RecoveryStoreError>;

    /// Tasks inserted by `enqueue` and not yet drawn by a `run-batch`.
    async fn write_queue(&self, tasks: &[QueuedTask]) -> Result<(), RecoveryStoreError>;
    async fn read_queue(&self) -> Result<Vec<QueuedTask>, RecoveryStoreError>;

    /// Free context-briefing cache entries, persisted so a restart doesn't cost
    /// another round of no-LLM context assembly.
    async fn write_scout_cache(&self, entries: &[ScoutCacheEntry]) -> Result<(), RecoveryStoreError>;
    async fn read_scout_cache(&self) -> Result<Vec<ScoutCacheEntry>, RecoveryStoreError>;

    fn worktree_root(&self) -> PathBuf;
    fn failed_worktree_root(&self) -> PathBuf;
}

/// VCS operations used verbatim by the worktree manager, executor, and merge queue.
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn rev_parse_head(&self, repo: &Path) -> Result<String, VcsError>;
    async fn diff_name_only(&self, repo: &Path, base: &str) -> Result<Vec<String>, VcsError>;
    async fn diff_stat(&self, repo: &Path, base: &str) -> Result<(u32, u32), VcsError>;
    async fn add_all(&self, repo: &Path) -> Result<(), VcsError>;
    async fn commit(&self, repo: &Path, message: &str) -> Result<String, VcsError>;
    async fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<(), VcsError>;
    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<(), VcsError>;
    async fn reset_hard_clean(&self, worktree: &Path) -> Result<(), VcsError>;
    async fn fetch(&self, repo: &Path) -> Result<(), VcsError>;
    async fn rebase(&self, worktree: &Path, onto: &str) -> Result<Result<(), Vec<String>>, VcsError>;
    async fn rebase_continue(&self, worktree: &Path) -> Result<bool, VcsError>;
    async fn rebase_abort(&self, worktree: &Path) -> Result<(), VcsError>;
    async fn merge_no_ff(&self, repo: &Path, branch: &str, strategy: Option<&str>) -> Result<Result<(), Vec<String>>, VcsError>;
    async fn merge_tree_preview(&self, repo: &Path, branch_a: &str, branch_b: &str) -> Result<Vec<String>, VcsError>;
    async fn push(&self, repo: &Path, branch: &str) -> Result<(), VcsError>;
    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, VcsError>;
}

/// Used by invariant-2 style reconciliation at startup: is a recorded pid alive?
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub type Timestamp = DateTime<Utc>;
