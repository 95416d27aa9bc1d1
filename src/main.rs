//! `engine` CLI entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use swarmwright::cli::commands::{
    enqueue, merge_queue, run_batch, status, worktree, Cli, Commands, MergeQueueCommands,
    StatusCommands, WorktreeCommands,
};
use swarmwright::domain::models::BatchOptions;
use swarmwright::domain::ports::AgentInvoker;
use swarmwright::infrastructure::claude::{AnthropicInvoker, MockInvoker, MockOutcome};
use swarmwright::infrastructure::config::loader::SubstrateKind;
use swarmwright::infrastructure::config::ConfigLoader;
use swarmwright::infrastructure::logging::LoggerImpl;
use swarmwright::infrastructure::recovery_store::FileRecoveryStore;
use swarmwright::infrastructure::vcs::GitClient;
use swarmwright::services::{
    BatchSchedulerConfig, FileRateLimitTracker, GitWorktreeManager, MergeQueue,
    MergeQueueRunConfig, ScoutCache, Scheduler, ShellVerifier, TaskExecutor, TaskExecutorConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match ConfigLoader::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    let _logger = LoggerImpl::init(&config.logging).context("failed to initialize logging")?;

    let repo = std::env::current_dir().context("failed to resolve working directory")?;
    let state_dir = if config.state_dir.is_absolute() {
        config.state_dir.clone()
    } else {
        repo.join(&config.state_dir)
    };
    tokio::fs::create_dir_all(&state_dir).await.context("failed to create state directory")?;

    let store = Arc::new(FileRecoveryStore::new(state_dir.clone()));
    let vcs = Arc::new(GitClient::new());
    let verifier = Arc::new(ShellVerifier::new(config.verifier.clone(), vcs.clone()));
    let worktrees = Arc::new(GitWorktreeManager::new(
        repo.clone(),
        state_dir.join("worktrees"),
        state_dir.join("failed-worktrees"),
        vcs.clone(),
        config.worktree.max_preserved_failed,
    ));
    let rate_limit = Arc::new(FileRateLimitTracker::new(store.clone()));
    let scout_cache = Arc::new(ScoutCache::new(store.clone()));
    scout_cache.load().await;

    let invoker: Arc<dyn AgentInvoker> = match config.substrate.kind {
        SubstrateKind::Anthropic => {
            let api_key = std::env::var(&config.substrate.api_key_env_var).unwrap_or_default();
            Arc::new(AnthropicInvoker::new(api_key).context("failed to build Anthropic client")?)
        }
        SubstrateKind::Mock => Arc::new(MockInvoker::new(MockOutcome::success("mock response"))),
    };

    let executor = Arc::new(TaskExecutor::new(
        invoker.clone(),
        verifier.clone(),
        vcs.clone(),
        store.clone(),
        rate_limit.clone(),
        worktrees.clone(),
        scout_cache,
        TaskExecutorConfig::default(),
    ));

    let scheduler = Scheduler::new(
        executor,
        worktrees.clone(),
        rate_limit.clone(),
        store.clone(),
        BatchSchedulerConfig {
            max_concurrent: config.max_concurrent,
            poll_interval_secs: config.scheduler_poll_interval_secs,
            graceful_shutdown_secs: config.graceful_shutdown_secs,
            base_branch: "main".to_string(),
        },
    );

    let merge_queue = MergeQueue::new(
        vcs,
        verifier,
        invoker,
        rate_limit.clone(),
        store.clone(),
        worktrees.clone(),
        repo,
        MergeQueueRunConfig {
            max_retries: config.merge_queue.max_retries,
            backoff_base_ms: config.merge_queue.backoff_base_ms,
            backoff_cap_ms: config.merge_queue.backoff_cap_ms,
            overlap_warning_files: config.merge_queue.overlap_warning_files,
            overlap_error_files: config.merge_queue.overlap_error_files,
            trunk_branch: "main".to_string(),
        },
    );

    let exit_code = match cli.command {
        Commands::Enqueue { objective, model, max_attempts, review_passes, auto_commit } => {
            enqueue::handle(
                store.as_ref(),
                objective,
                model.into(),
                max_attempts,
                review_passes,
                auto_commit,
                cli.json,
            )
            .await?;
            0
        }
        Commands::RunBatch { max_concurrent, auto_commit, review_passes, multi_lens_at_opus } => {
            let options = BatchOptions {
                max_concurrent,
                auto_commit,
                review_passes,
                multi_lens_at_opus,
            };
            run_batch::handle(&scheduler, &merge_queue, store.as_ref(), options, cli.json).await?
        }
        Commands::Status { command } => {
            match command {
                StatusCommands::Tasks => status::handle_tasks(store.as_ref(), cli.json).await?,
                StatusCommands::MergeQueue => {
                    status::handle_merge_queue(store.as_ref(), cli.json).await?
                }
                StatusCommands::RateLimit => {
                    status::handle_rate_limit(rate_limit.as_ref(), cli.json).await?
                }
            }
            0
        }
        Commands::Worktree { command } => {
            match command {
                WorktreeCommands::List => worktree::handle_list(&worktrees, cli.json).await?,
                WorktreeCommands::Prune => worktree::handle_prune(&worktrees).await?,
            }
            0
        }
        Commands::MergeQueue { command } => {
            match command {
                MergeQueueCommands::Retry { branch } => {
                    merge_queue::handle_retry(store.as_ref(), &branch).await?
                }
            }
            0
        }
    };

    std::process::exit(exit_code);
}
