//! `engine merge-queue retry` — re-queue a terminal merge-queue item by hand.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::MergeStatus;
use crate::domain::ports::RecoveryStore;

#[derive(Serialize)]
pub struct RetryOutput {
    pub branch: String,
    pub status: String,
}

impl CommandOutput for RetryOutput {
    fn to_human(&self) -> String {
        format!("{}: re-queued ({})", self.branch, self.status)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn handle_retry(store: &dyn RecoveryStore, branch: &str) -> Result<()> {
    let mut items = store.read_merge_queue().await?;
    let Some(item) = items.iter_mut().find(|i| i.branch == branch) else {
        bail!("no merge-queue item for branch {branch}");
    };
    if !matches!(item.status, MergeStatus::Conflict | MergeStatus::TestFailed) {
        bail!("{branch} is not in a terminal state ({:?})", item.status);
    }
    item.status = MergeStatus::Pending;
    item.retry_count = 0;
    item.next_retry_after = None;
    item.original_error = None;
    item.is_retry = true;
    item.completed_at = None;
    let status = format!("{:?}", item.status);
    let branch = item.branch.clone();
    store.write_merge_queue(&items).await?;

    output(&RetryOutput { branch, status }, false);
    Ok(())
}
