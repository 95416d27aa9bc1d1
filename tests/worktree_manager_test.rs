use chrono::{Duration, Utc};
use std::sync::Arc;
use swarmwright::infrastructure::vcs::git::validate_branch_name;
use swarmwright::infrastructure::vcs::GitClient;
use swarmwright::services::GitWorktreeManager;
use tempfile::tempdir;

fn write_preserved_meta(failed_root: &std::path::Path, task_id: &str, preserved_at: chrono::DateTime<Utc>) {
    std::fs::create_dir_all(failed_root).unwrap();
    let meta = serde_json::json!({
        "task_id": task_id,
        "branch": format!("undercity/quiet-otter/{task_id}"),
        "acquired_at": preserved_at,
        "preserved_at": preserved_at,
        "error": "verification failed",
    });
    std::fs::write(
        failed_root.join(format!("{task_id}.meta.json")),
        serde_json::to_vec_pretty(&meta).unwrap(),
    )
    .unwrap();
}

fn manager(dir: &tempfile::TempDir) -> GitWorktreeManager {
    GitWorktreeManager::new(
        dir.path().join("repo"),
        dir.path().join("worktrees"),
        dir.path().join("failed-worktrees"),
        Arc::new(GitClient::new()),
        2,
    )
}

#[tokio::test]
async fn list_active_is_empty_when_no_worktrees_exist() {
    let dir = tempdir().unwrap();
    let mgr = manager(&dir);
    assert!(mgr.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn list_preserved_reads_failed_metas() {
    let dir = tempdir().unwrap();
    let mgr = manager(&dir);

    write_preserved_meta(&dir.path().join("failed-worktrees"), "task-1", Utc::now());

    let preserved = mgr.list_preserved().await.unwrap();
    assert_eq!(preserved.len(), 1);
    assert_eq!(preserved[0].task_id, "task-1");
    assert_eq!(preserved[0].error.as_deref(), Some("verification failed"));
}

#[tokio::test]
async fn prune_keeps_only_max_preserved_most_recent() {
    let dir = tempdir().unwrap();
    let mgr = manager(&dir);
    let failed_root = dir.path().join("failed-worktrees");

    let now = Utc::now();
    write_preserved_meta(&failed_root, "oldest", now - Duration::hours(3));
    write_preserved_meta(&failed_root, "middle", now - Duration::hours(2));
    write_preserved_meta(&failed_root, "newest", now - Duration::hours(1));

    let removed = mgr.prune().await.unwrap();
    assert_eq!(removed, 1);

    let remaining = mgr.list_preserved().await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|m| m.task_id != "oldest"));
}

fn run_git(cwd: &std::path::Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

async fn init_repo(dir: &std::path::Path) {
    tokio::fs::create_dir_all(dir).await.unwrap();
    run_git(dir, &["init", "-q", "-b", "main"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "user.name", "test"]);
    tokio::fs::write(dir.join("README.md"), "hello").await.unwrap();
    run_git(dir, &["add", "."]);
    run_git(dir, &["commit", "-q", "-m", "initial"]);
}

#[tokio::test]
async fn acquire_reuses_an_existing_worktree_for_a_recovered_task() {
    use swarmwright::domain::ports::WorktreeManager;

    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    init_repo(&repo).await;

    let mgr = GitWorktreeManager::new(
        repo.clone(),
        dir.path().join("worktrees"),
        dir.path().join("failed-worktrees"),
        Arc::new(GitClient::new()),
        2,
    );

    let first = mgr.acquire("task-7", "main").await.unwrap();
    let second = mgr.acquire("task-7", "main").await.unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(first.branch, second.branch);
}

#[tokio::test]
async fn acquire_errors_when_path_exists_but_metadata_does_not_match() {
    use swarmwright::domain::ports::WorktreeManager;

    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    init_repo(&repo).await;

    let mgr = GitWorktreeManager::new(
        repo.clone(),
        dir.path().join("worktrees"),
        dir.path().join("failed-worktrees"),
        Arc::new(GitClient::new()),
        2,
    );

    // A directory with no matching metadata is a genuine conflict, not a resume.
    tokio::fs::create_dir_all(dir.path().join("worktrees").join("task-8")).await.unwrap();
    let result = mgr.acquire("task-8", "main").await;
    assert!(result.is_err());
}

#[test]
fn branch_names_reject_flag_like_and_escaping_inputs() {
    assert!(validate_branch_name("undercity/quiet-otter/abc").is_ok());
    assert!(validate_branch_name("-rf").is_err());
    assert!(validate_branch_name("feature/../escape").is_err());
    assert!(validate_branch_name("has space").is_err());
    assert!(validate_branch_name("").is_err());
    assert!(validate_branch_name("trailing.lock").is_err());
}
