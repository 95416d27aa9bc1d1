//! `engine enqueue` — insert a task into the queue for the next run-batch.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{ModelTier, QueuedTask};
use crate::domain::ports::RecoveryStore;

#[derive(Serialize)]
pub struct EnqueueOutput {
    pub objective: String,
    pub model: ModelTier,
    pub queue_depth: usize,
}

impl CommandOutput for EnqueueOutput {
    fn to_human(&self) -> String {
        format!(
            "Queued: {} (model: {:?})\n{} task(s) now pending",
            self.objective, self.model, self.queue_depth
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn handle(
    store: &dyn RecoveryStore,
    objective: String,
    model: ModelTier,
    max_attempts: u32,
    review_passes: bool,
    auto_commit: bool,
    json_mode: bool,
) -> Result<()> {
    let mut tasks = store.read_queue().await?;
    tasks.push(QueuedTask {
        objective: objective.clone(),
        model,
        max_attempts,
        review_passes,
        auto_commit,
        queued_at: Utc::now(),
    });
    let queue_depth = tasks.len();
    store.write_queue(&tasks).await?;

    output(&EnqueueOutput { objective, model, queue_depth }, json_mode);
    Ok(())
}
