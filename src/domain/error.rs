//! Error taxonomy. Each subsystem gets its own `thiserror`-derived enum carrying an
//! `is_permanent`/`is_transient` classification; `EngineError` unifies them at the
//! application boundary via `#[from]`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("failed to spawn verifier command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worktree path does not exist: {0}")]
    MissingWorktree(String),
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    Git(String),

    #[error("worktree already exists for task {0}")]
    AlreadyExists(String),

    #[error("worktree not found for task {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("state file corrupt: {0}")]
    CorruptState(String),

    #[error("recovery store error: {0}")]
    Store(#[from] RecoveryStoreError),
}

#[derive(Debug, Error, Clone)]
pub enum AgentInvokerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl AgentInvokerError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError(_) | Self::NetworkError(_)
        )
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient() && !matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("command `git {args}` failed (status {status:?}): {stderr}")]
    CommandFailed {
        args: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("merge conflict in files: {0:?}")]
    Conflict(Vec<String>),

    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VcsError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Error)]
pub enum MergeQueueError {
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),

    #[error("verification failed after rebase")]
    TestFailed,

    #[error("store error: {0}")]
    Store(#[from] RecoveryStoreError),

    #[error("agent invocation failed during conflict resolution: {0}")]
    Agent(#[from] AgentInvokerError),
}

#[derive(Debug, Error)]
pub enum RecoveryStoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("lock acquisition exhausted for {0}, proceeding unlocked")]
    LockExhausted(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),

    #[error("store error: {0}")]
    Store(#[from] RecoveryStoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("agent error: {0}")]
    Agent(#[from] AgentInvokerError),

    #[error("verifier error: {0}")]
    Verifier(#[from] VerifierError),

    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),

    #[error("store error: {0}")]
    Store(#[from] RecoveryStoreError),

    #[error("max attempts ({0}) exhausted")]
    AttemptsExhausted(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_concurrent must be >= 1, got {0}")]
    InvalidMaxConcurrent(u32),

    #[error("backoff_base_ms must be <= backoff_cap_ms ({0} > {1})")]
    InvalidBackoff(u64, u64),

    #[error("token multiplier for {model} must be positive, got {value}")]
    InvalidTokenMultiplier { model: String, value: f64 },

    #[error("warning_threshold must be in (0, 1], got {0}")]
    InvalidWarningThreshold(f64),

    #[error("figment error: {0}")]
    Figment(#[from] figment::Error),
}

/// Crate-level error, unifying every subsystem error at the application/CLI boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    MergeQueue(#[from] MergeQueueError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Store(#[from] RecoveryStoreError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Agent(#[from] AgentInvokerError),
}
