//! Command definitions and handlers.

pub mod enqueue;
pub mod merge_queue;
pub mod run_batch;
pub mod status;
pub mod worktree;

use clap::{Parser, Subcommand, ValueEnum};

use crate::domain::models::ModelTier;

#[derive(Parser)]
#[command(name = "engine")]
#[command(about = "Crash-recoverable orchestrator for LLM coding agents against Git repos", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format (every read command honors this)
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Insert a task into the queue, to be drawn by the next run-batch
    Enqueue {
        /// Task objective in natural language
        objective: String,

        /// Model tier to start the task at
        #[arg(long, value_enum, default_value_t = CliModel::Sonnet)]
        model: CliModel,

        /// Maximum escalation attempts before the task is terminal-failed
        #[arg(long, default_value = "6")]
        max_attempts: u32,

        /// Run an extra review pass at opus before accepting a verified result
        #[arg(long)]
        review_passes: bool,

        /// Auto-commit on successful verification without asking
        #[arg(long)]
        auto_commit: bool,
    },

    /// Start the scheduler against every queued task
    RunBatch {
        /// Maximum tasks running concurrently
        #[arg(long, default_value = "4")]
        max_concurrent: u32,

        /// Auto-commit on successful verification without asking
        #[arg(long)]
        auto_commit: bool,

        /// Run an extra review pass at opus before accepting a verified result
        #[arg(long)]
        review_passes: bool,

        /// Run a second, independent opus reviewer alongside escalated tasks
        #[arg(long)]
        multi_lens_at_opus: bool,
    },

    /// Inspect engine state
    Status {
        #[command(subcommand)]
        command: StatusCommands,
    },

    /// Manage isolated Git worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },

    /// Manage the merge queue
    MergeQueue {
        #[command(subcommand)]
        command: MergeQueueCommands,
    },
}

#[derive(Subcommand)]
pub enum StatusCommands {
    /// Active and completed tasks
    Tasks,
    /// Pending, retrying, and terminal merge-queue items
    MergeQueue,
    /// Token usage and pause state across both sliding windows
    RateLimit,
}

#[derive(Subcommand)]
pub enum WorktreeCommands {
    /// Worktrees currently checked out by an in-flight task
    List,
    /// Delete the oldest preserved (failed/conflicted) worktrees past the configured cap
    Prune,
}

#[derive(Subcommand)]
pub enum MergeQueueCommands {
    /// Re-queue a terminal (conflict or test-failed) item for another attempt
    Retry {
        /// Branch name of the merge-queue item
        branch: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliModel {
    Sonnet,
    Opus,
}

impl From<CliModel> for ModelTier {
    fn from(value: CliModel) -> Self {
        match value {
            CliModel::Sonnet => ModelTier::Sonnet,
            CliModel::Opus => ModelTier::Opus,
        }
    }
}
