//! A crash-recoverable orchestrator that runs many LLM coding agents against a Git
//! repository in parallel:
//! - Shell-command verification (typecheck/lint/test/build) per task
//! - Isolated Git worktrees per task, named deterministically from the task id
//! - Empirical token-usage tracking with proactive rate-limit pausing
//! - An adaptive escalation state machine (sonnet -> opus) per task
//! - A bounded-concurrency scheduler with crash recovery from on-disk state
//! - A one-at-a-time merge queue with conflict resolution and retry

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::EngineError;
pub use infrastructure::config::EngineConfig;
