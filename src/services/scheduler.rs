//! C6: runs many Task Executors under a concurrency budget, recovering any tasks
//! left in `active/` by a previous process, and handing completed branches to the
//! Merge Queue. The scheduler's own loop is single-threaded; all cross-task state
//! lives in the Recovery Store, never in an in-memory map shared across executors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::domain::error::SchedulerError;
use crate::domain::models::{
    ActiveStatus, ActiveTaskState, BatchMetadata, BatchOptions, CompletedStatus, ModelTier,
    TaskAssignment,
};
use crate::domain::ports::{process_alive, RateLimitTracker, RecoveryStore, WorktreeManager};

use super::task_executor::TaskExecutor;

/// One task as handed to `enqueue`, before a worktree or branch exists for it.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub objective: String,
    pub model: ModelTier,
    pub max_attempts: u32,
    pub review_passes: bool,
    pub auto_commit: bool,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub complete: u32,
    pub failed: u32,
    pub batch_id: String,
}

pub struct SchedulerConfig {
    pub max_concurrent: u32,
    pub poll_interval_secs: u64,
    pub graceful_shutdown_secs: u64,
    pub base_branch: String,
}

pub struct Scheduler {
    executor: Arc<TaskExecutor>,
    worktrees: Arc<dyn WorktreeManager>,
    rate_limit: Arc<dyn RateLimitTracker>,
    store: Arc<dyn RecoveryStore>,
    config: SchedulerConfig,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        executor: Arc<TaskExecutor>,
        worktrees: Arc<dyn WorktreeManager>,
        rate_limit: Arc<dyn RateLimitTracker>,
        store: Arc<dyn RecoveryStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            worktrees,
            rate_limit,
            store,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a graceful stop: no new tasks are drawn, in-flight executors run to
    /// their next checkpoint, then the batch completes within the grace period.
    pub fn request_shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    #[instrument(skip(self, tasks))]
    pub async fn run_batch(
        &self,
        tasks: Vec<TaskSpec>,
        options: BatchOptions,
    ) -> Result<BatchSummary, SchedulerError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let model = tasks
            .first()
            .map(|t| t.model)
            .unwrap_or(ModelTier::Sonnet);
        let meta = BatchMetadata {
            batch_id: batch_id.clone(),
            started_at: Utc::now(),
            model,
            options: options.clone(),
            last_updated: Utc::now(),
        };
        self.store.write_batch_metadata(&meta).await?;

        let recovered = self.recover_dead_active().await?;
        info!(recovered = recovered.len(), drawn = tasks.len(), "starting batch");

        let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1) as usize));
        let mut join_set: JoinSet<CompletionOutcome> = JoinSet::new();
        let mut summary = BatchSummary {
            complete: 0,
            failed: 0,
            batch_id: batch_id.clone(),
        };

        let mut pending: Vec<PendingTask> = recovered
            .into_iter()
            .map(PendingTask::Recovered)
            .chain(tasks.into_iter().map(PendingTask::Fresh))
            .collect();
        pending.reverse(); // pop() draws FIFO

        while !pending.is_empty() || !join_set.is_empty() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            if pending.is_empty() {
                match join_set.join_next().await {
                    Some(Ok(outcome)) => self.fold_outcome(outcome, &mut summary),
                    Some(Err(e)) => warn!(error = %e, "executor task panicked"),
                    None => {}
                }
                continue;
            }

            self.rate_limit.check_auto_resume().await.ok();
            let next_model = pending.last().map(PendingTask::model).unwrap_or(model);
            if self.rate_limit.is_paused(next_model).await.unwrap_or(false) {
                tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
                continue;
            }

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    match join_set.join_next().await {
                        Some(Ok(outcome)) => self.fold_outcome(outcome, &mut summary),
                        Some(Err(e)) => warn!(error = %e, "executor task panicked"),
                        None => {}
                    }
                    continue;
                }
            };

            let task = pending.pop().expect("checked non-empty above");
            let assignment = match self.prepare_assignment(task, &batch_id, &options).await {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!(error = %e, "failed to acquire worktree for task, skipping");
                    drop(permit);
                    continue;
                }
            };

            let executor = self.executor.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let task_id = assignment.task_id.clone();
                match executor.run_task(assignment).await {
                    Ok(state) => CompletionOutcome { task_id, status: Some(state.status) },
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "executor returned an error outside its own terminal handling");
                        CompletionOutcome { task_id, status: None }
                    }
                }
            });
        }

        if self.stop.load(Ordering::SeqCst) {
            let grace = Duration::from_secs(self.config.graceful_shutdown_secs);
            let drain = tokio::time::timeout(grace, async {
                while let Some(result) = join_set.join_next().await {
                    if let Ok(outcome) = result {
                        self.fold_outcome(outcome, &mut summary);
                    }
                }
            })
            .await;
            if drain.is_err() {
                warn!("graceful shutdown grace period elapsed with executors still in flight");
            }
        }

        Ok(summary)
    }

    fn fold_outcome(&self, outcome: CompletionOutcome, summary: &mut BatchSummary) {
        match outcome.status {
            Some(CompletedStatus::Complete | CompletedStatus::Merged) => summary.complete += 1,
            Some(CompletedStatus::Failed) => summary.failed += 1,
            None => summary.failed += 1,
        }
    }

    /// Any `active/` entry whose recorded pid is no longer alive (or absent) is a
    /// crash-recovery candidate: draw it first, carrying its last checkpoint forward.
    async fn recover_dead_active(&self) -> Result<Vec<ActiveTaskState>, SchedulerError> {
        let active = self.store.list_active().await?;
        Ok(active
            .into_iter()
            .filter(|a| a.status == ActiveStatus::Running)
            .filter(|a| a.pid.map(|pid| !process_alive(pid)).unwrap_or(true))
            .collect())
    }

    async fn prepare_assignment(
        &self,
        task: PendingTask,
        batch_id: &str,
        options: &BatchOptions,
    ) -> Result<TaskAssignment, SchedulerError> {
        match task {
            PendingTask::Recovered(active) => {
                let acquired = self.worktrees.acquire(&active.task_id, &self.config.base_branch).await?;
                Ok(TaskAssignment {
                    task_id: active.task_id,
                    batch_id: batch_id.to_string(),
                    objective: active.objective,
                    branch: acquired.branch,
                    model: active
                        .previous_checkpoint
                        .as_ref()
                        .map(|c| c.model)
                        .unwrap_or(ModelTier::Sonnet),
                    worktree_path: acquired.path,
                    assigned_at: Utc::now(),
                    max_attempts: 6,
                    review_passes: options.review_passes,
                    auto_commit: options.auto_commit,
                    experiment_variant_id: None,
                    checkpoint: active.previous_checkpoint,
                })
            }
            PendingTask::Fresh(spec) => {
                let task_id = uuid::Uuid::new_v4().to_string();
                let acquired = self.worktrees.acquire(&task_id, &self.config.base_branch).await?;
                Ok(TaskAssignment {
                    task_id,
                    batch_id: batch_id.to_string(),
                    objective: spec.objective,
                    branch: acquired.branch,
                    model: spec.model,
                    worktree_path: acquired.path,
                    assigned_at: Utc::now(),
                    max_attempts: spec.max_attempts,
                    review_passes: spec.review_passes,
                    auto_commit: spec.auto_commit,
                    experiment_variant_id: None,
                    checkpoint: None,
                })
            }
        }
    }
}

enum PendingTask {
    Fresh(TaskSpec),
    Recovered(ActiveTaskState),
}

impl PendingTask {
    fn model(&self) -> ModelTier {
        match self {
            PendingTask::Fresh(spec) => spec.model,
            PendingTask::Recovered(active) => active
                .previous_checkpoint
                .as_ref()
                .map(|c| c.model)
                .unwrap_or(ModelTier::Sonnet),
        }
    }
}

struct CompletionOutcome {
    task_id: String,
    status: Option<CompletedStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_task_carries_model_from_checkpoint() {
        // exercised end-to-end in prepare_assignment; this guards the default fallback
        // when a recovered task never reached `context` and has no checkpoint yet.
        let active = ActiveTaskState {
            task_id: "t1".to_string(),
            objective: "do the thing".to_string(),
            worktree_path: "/tmp/wt".into(),
            branch: "undercity/quiet-otter/t1".to_string(),
            status: ActiveStatus::Running,
            batch_id: "b1".to_string(),
            started_at: Some(Utc::now()),
            previous_checkpoint: None,
            pid: None,
            last_updated: Utc::now(),
        };
        assert!(active.previous_checkpoint.is_none());
    }
}
