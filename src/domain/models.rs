//! Core data model: task assignments, checkpoints, merge-queue items, rate-limit state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// The closed set of models the engine is willing to route work to.
///
/// `Haiku` is accepted on read only, for batches persisted by an older build; it is
/// normalized to `Sonnet` the first time such a record is touched (see `ModelTier::normalize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// Collapse the legacy `haiku` tier onto `sonnet`.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            Self::Haiku => Self::Sonnet,
            other => other,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }

    /// Next tier in the escalation ladder, if any.
    #[must_use]
    pub fn escalate(self) -> Option<Self> {
        match self.normalize() {
            Self::Sonnet => Some(Self::Opus),
            Self::Opus | Self::Haiku => None,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse task-complexity label produced by the (LLM-free) complexity assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Standard,
    Complex,
    Critical,
}

impl Complexity {
    #[must_use]
    pub fn starting_model(self) -> ModelTier {
        match self {
            Self::Critical => ModelTier::Opus,
            Self::Complex => ModelTier::Sonnet,
            Self::Standard | Self::Simple | Self::Trivial => ModelTier::Sonnet,
        }
    }

    #[must_use]
    pub fn wants_multi_lens(self) -> bool {
        matches!(self, Self::Complex | Self::Critical)
    }
}

/// A verifier-observed category of failure, used to drive the escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Lint,
    Spell,
    Typecheck,
    Test,
    Build,
    NoChanges,
    Timeout,
    Unknown,
}

/// A single issue surfaced by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub category: ErrorCategory,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Structured verdict returned by the verifier (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub typecheck_passed: bool,
    pub tests_passed: bool,
    pub lint_passed: bool,
    pub spell_passed: bool,
    pub code_health_passed: bool,
    pub files_changed: u32,
    pub lines_changed: u32,
    pub issues: Vec<VerificationIssue>,
    pub feedback: String,
}

impl VerificationResult {
    /// Distinct categories observed among `issues`, used by the escalation policy.
    #[must_use]
    pub fn categories(&self) -> std::collections::HashSet<ErrorCategory> {
        self.issues.iter().map(|i| i.category).collect()
    }
}

/// Token usage reported by a single agent invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Per-phase breadcrumb, flushed atomically on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Context,
    Executing,
    Verifying,
    Reviewing,
    Committing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastVerification {
    pub passed: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: Phase,
    pub model: ModelTier,
    pub attempts: u32,
    pub saved_at: DateTime<Utc>,
    pub last_verification: Option<LastVerification>,
}

impl Checkpoint {
    #[must_use]
    pub fn starting(model: ModelTier) -> Self {
        Self {
            phase: Phase::Starting,
            model,
            attempts: 0,
            saved_at: Utc::now(),
            last_verification: None,
        }
    }
}

/// Immutable record written to disk before an executor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub batch_id: String,
    pub objective: String,
    pub branch: String,
    pub model: ModelTier,
    pub worktree_path: PathBuf,
    pub assigned_at: DateTime<Utc>,
    pub max_attempts: u32,
    pub review_passes: bool,
    pub auto_commit: bool,
    pub experiment_variant_id: Option<String>,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTaskState {
    pub task_id: String,
    pub objective: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub status: ActiveStatus,
    pub batch_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub previous_checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedStatus {
    Complete,
    Failed,
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTaskState {
    pub task_id: String,
    pub objective: String,
    pub status: CompletedStatus,
    pub batch_id: String,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
    pub modified_files: Vec<String>,
    pub commit_sha: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub max_concurrent: u32,
    pub auto_commit: bool,
    pub review_passes: bool,
    pub multi_lens_at_opus: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            auto_commit: false,
            review_passes: false,
            multi_lens_at_opus: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub model: ModelTier,
    pub options: BatchOptions,
    pub last_updated: DateTime<Utc>,
}

/// A task inserted via `engine enqueue`, waiting for the next `run-batch` to draw it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub objective: String,
    pub model: ModelTier,
    pub max_attempts: u32,
    pub review_passes: bool,
    pub auto_commit: bool,
    pub queued_at: DateTime<Utc>,
}

/// One persisted scout-cache entry, keyed by `(fingerprint_hash, goal_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutCacheEntry {
    pub fingerprint_hash: u64,
    pub goal_hash: u64,
    pub target_files: Vec<String>,
    pub fingerprint: String,
    pub last_used_at: DateTime<Utc>,
}

/// Lifecycle status of a merge-queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Rebasing,
    Testing,
    Merging,
    Pushing,
    Complete,
    Conflict,
    TestFailed,
}

impl MergeStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Conflict)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Theirs,
    Ours,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueItem {
    pub branch: String,
    pub task_id: String,
    pub agent_id: String,
    pub status: MergeStatus,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub modified_files: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub original_error: Option<String>,
    pub is_retry: bool,
    pub strategy_used: Option<MergeStrategy>,
    pub duration_ms: Option<u64>,
}

/// Severity of a pre-merge overlap between two pending queue items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueConflictNote {
    pub branch_a: String,
    pub branch_b: String,
    pub files: Vec<String>,
    pub severity: OverlapSeverity,
}

/// A single task's recorded token usage, used to reconstruct sliding windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTaskUsage {
    pub task_id: String,
    pub model: ModelTier,
    pub tokens: TokenUsage,
    pub sonnet_equivalent: u64,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A single observed 429 from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitHit {
    pub model: ModelTier,
    pub timestamp: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMultipliers {
    pub sonnet: f64,
    pub opus: f64,
}

impl Default for TokenMultipliers {
    fn default() -> Self {
        Self {
            sonnet: 1.0,
            opus: 12.0,
        }
    }
}

impl TokenMultipliers {
    #[must_use]
    pub fn for_model(&self, model: ModelTier) -> f64 {
        match model.normalize() {
            ModelTier::Sonnet => self.sonnet,
            ModelTier::Opus => self.opus,
            ModelTier::Haiku => self.sonnet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitThresholds {
    pub max_tokens_per_5_hours: u64,
    pub max_tokens_per_week: u64,
    pub warning_threshold: f64,
    pub hysteresis_threshold: f64,
    pub token_multipliers: TokenMultipliers,
}

impl Default for RateLimitThresholds {
    fn default() -> Self {
        Self {
            max_tokens_per_5_hours: 5_000_000,
            max_tokens_per_week: 50_000_000,
            warning_threshold: 0.8,
            hysteresis_threshold: 0.9,
            token_multipliers: TokenMultipliers::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPauseState {
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
}

impl Default for ModelPauseState {
    fn default() -> Self {
        Self {
            is_paused: false,
            paused_at: None,
            resume_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    pub limited_model: Option<ModelTier>,
    pub reason: Option<String>,
    pub model_pauses: HashMap<String, ModelPauseState>,
}

impl Default for PauseState {
    fn default() -> Self {
        Self {
            is_paused: false,
            paused_at: None,
            resume_at: None,
            limited_model: None,
            reason: None,
            model_pauses: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub tasks: Vec<RateLimitTaskUsage>,
    pub hits: Vec<RateLimitHit>,
    pub config: RateLimitThresholds,
    pub pause: PauseState,
    pub last_updated: DateTime<Utc>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            hits: Vec::new(),
            config: RateLimitThresholds::default(),
            pause: PauseState::default(),
            last_updated: Utc::now(),
        }
    }
}
