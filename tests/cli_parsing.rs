use clap::Parser;
use swarmwright::cli::commands::{Cli, Commands, MergeQueueCommands, StatusCommands, WorktreeCommands};

#[test]
fn test_parse_enqueue_defaults() {
    let cli = Cli::try_parse_from(vec!["engine", "enqueue", "Add retry logic"]).unwrap();

    match cli.command {
        Commands::Enqueue { objective, max_attempts, review_passes, auto_commit, .. } => {
            assert_eq!(objective, "Add retry logic");
            assert_eq!(max_attempts, 6);
            assert!(!review_passes);
            assert!(!auto_commit);
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn test_parse_enqueue_with_flags() {
    let cli = Cli::try_parse_from(vec![
        "engine",
        "enqueue",
        "Refactor parser",
        "--model",
        "opus",
        "--max-attempts",
        "3",
        "--review-passes",
        "--auto-commit",
    ])
    .unwrap();

    match cli.command {
        Commands::Enqueue { max_attempts, review_passes, auto_commit, .. } => {
            assert_eq!(max_attempts, 3);
            assert!(review_passes);
            assert!(auto_commit);
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn test_parse_run_batch_defaults() {
    let cli = Cli::try_parse_from(vec!["engine", "run-batch"]).unwrap();

    match cli.command {
        Commands::RunBatch { max_concurrent, auto_commit, review_passes, multi_lens_at_opus } => {
            assert_eq!(max_concurrent, 4);
            assert!(!auto_commit);
            assert!(!review_passes);
            assert!(!multi_lens_at_opus);
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn test_parse_status_subcommands() {
    let tasks = Cli::try_parse_from(vec!["engine", "status", "tasks"]).unwrap();
    assert!(matches!(
        tasks.command,
        Commands::Status { command: StatusCommands::Tasks }
    ));

    let merge_queue = Cli::try_parse_from(vec!["engine", "status", "merge-queue"]).unwrap();
    assert!(matches!(
        merge_queue.command,
        Commands::Status { command: StatusCommands::MergeQueue }
    ));

    let rate_limit = Cli::try_parse_from(vec!["engine", "status", "rate-limit"]).unwrap();
    assert!(matches!(
        rate_limit.command,
        Commands::Status { command: StatusCommands::RateLimit }
    ));
}

#[test]
fn test_parse_worktree_subcommands() {
    let list = Cli::try_parse_from(vec!["engine", "worktree", "list"]).unwrap();
    assert!(matches!(
        list.command,
        Commands::Worktree { command: WorktreeCommands::List }
    ));

    let prune = Cli::try_parse_from(vec!["engine", "worktree", "prune"]).unwrap();
    assert!(matches!(
        prune.command,
        Commands::Worktree { command: WorktreeCommands::Prune }
    ));
}

#[test]
fn test_parse_merge_queue_retry() {
    let cli =
        Cli::try_parse_from(vec!["engine", "merge-queue", "retry", "undercity/quiet-otter/abc"])
            .unwrap();

    match cli.command {
        Commands::MergeQueue { command: MergeQueueCommands::Retry { branch } } => {
            assert_eq!(branch, "undercity/quiet-otter/abc");
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn test_global_json_flag() {
    let cli = Cli::try_parse_from(vec!["engine", "--json", "status", "tasks"]).unwrap();
    assert!(cli.json);

    let cli = Cli::try_parse_from(vec!["engine", "status", "tasks"]).unwrap();
    assert!(!cli.json);
}

#[test]
fn test_enqueue_requires_objective() {
    let result = Cli::try_parse_from(vec!["engine", "enqueue"]);
    assert!(result.is_err());
}

#[test]
fn test_merge_queue_retry_requires_branch() {
    let result = Cli::try_parse_from(vec!["engine", "merge-queue", "retry"]);
    assert!(result.is_err());
}
