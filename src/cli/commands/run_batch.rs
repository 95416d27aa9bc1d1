//! `engine run-batch` — drain the queue and run the scheduler against it.

use anyhow::Result;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{BatchOptions, MergeStatus};
use crate::domain::ports::RecoveryStore;
use crate::services::{BatchSummary, BatchTaskSpec, MergeQueue, Scheduler};

#[derive(Serialize)]
pub struct RunBatchOutput {
    pub batch_id: String,
    pub complete: u32,
    pub failed: u32,
}

impl CommandOutput for RunBatchOutput {
    fn to_human(&self) -> String {
        format!(
            "Batch {}: {} complete, {} failed",
            self.batch_id, self.complete, self.failed
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Returns the process exit code per the CLI contract: 0 all complete/merged, 1 any failed.
pub async fn handle(
    scheduler: &Scheduler,
    merge_queue: &MergeQueue,
    store: &dyn RecoveryStore,
    options: BatchOptions,
    json_mode: bool,
) -> Result<i32> {
    let queued = store.read_queue().await?;
    let tasks: Vec<BatchTaskSpec> = queued
        .into_iter()
        .map(|t| BatchTaskSpec {
            objective: t.objective,
            model: t.model,
            max_attempts: t.max_attempts,
            review_passes: t.review_passes || options.review_passes,
            auto_commit: t.auto_commit || options.auto_commit,
        })
        .collect();
    store.write_queue(&[]).await?;

    let summary: BatchSummary = scheduler.run_batch(tasks, options).await?;
    merge_queue.drain(2_000).await?;

    let merge_failures = store
        .read_merge_queue()
        .await?
        .iter()
        .filter(|i| matches!(i.status, MergeStatus::Conflict | MergeStatus::TestFailed))
        .count() as u32;
    let exit_code = if summary.failed > 0 || merge_failures > 0 { 1 } else { 0 };

    output(
        &RunBatchOutput {
            batch_id: summary.batch_id,
            complete: summary.complete,
            failed: summary.failed + merge_failures,
        },
        json_mode,
    );
    Ok(exit_code)
}
