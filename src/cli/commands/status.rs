//! `engine status` — read-only snapshots of tasks, the merge queue, and rate limits.

use anyhow::Result;
use comfy_table::{presets, Attribute, Cell, ContentArrangement, Table};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{ActiveTaskState, CompletedTaskState, MergeQueueItem, RateLimitState};
use crate::domain::ports::{RateLimitTracker, RecoveryStore};

#[derive(Serialize)]
pub struct TasksOutput {
    pub active: Vec<ActiveTaskState>,
    pub completed: Vec<CompletedTaskState>,
}

impl CommandOutput for TasksOutput {
    fn to_human(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Task").add_attribute(Attribute::Bold),
                Cell::new("Status").add_attribute(Attribute::Bold),
                Cell::new("Branch").add_attribute(Attribute::Bold),
                Cell::new("Objective").add_attribute(Attribute::Bold),
            ]);

        for task in &self.active {
            table.add_row(vec![
                short_id(&task.task_id),
                format!("{:?}", task.status),
                task.branch.clone(),
                truncate(&task.objective, 50),
            ]);
        }
        for task in &self.completed {
            table.add_row(vec![
                short_id(&task.task_id),
                format!("{:?}", task.status),
                task.commit_sha.clone().unwrap_or_else(|| "-".to_string()),
                truncate(&task.objective, 50),
            ]);
        }

        if self.active.is_empty() && self.completed.is_empty() {
            return "No tasks recorded.".to_string();
        }
        table.to_string()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Serialize)]
pub struct MergeQueueOutput {
    pub items: Vec<MergeQueueItem>,
}

impl CommandOutput for MergeQueueOutput {
    fn to_human(&self) -> String {
        if self.items.is_empty() {
            return "Merge queue is empty.".to_string();
        }
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Branch").add_attribute(Attribute::Bold),
                Cell::new("Status").add_attribute(Attribute::Bold),
                Cell::new("Retries").add_attribute(Attribute::Bold),
                Cell::new("Strategy").add_attribute(Attribute::Bold),
            ]);
        for item in &self.items {
            table.add_row(vec![
                item.branch.clone(),
                format!("{:?}", item.status),
                format!("{}/{}", item.retry_count, item.max_retries),
                item.strategy_used
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|| "-".to_string()),
            ]);
        }
        table.to_string()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Serialize)]
pub struct RateLimitOutput {
    pub state: RateLimitState,
}

impl CommandOutput for RateLimitOutput {
    fn to_human(&self) -> String {
        let pause = &self.state.pause;
        let mut lines = vec![format!("Paused: {}", pause.is_paused)];
        if let Some(model) = pause.limited_model {
            lines.push(format!("Limited model: {model:?}"));
        }
        if let Some(resume_at) = pause.resume_at {
            lines.push(format!("Resumes at: {resume_at}"));
        }
        lines.push(format!("5h window entries: {}", self.state.tasks.len()));
        lines.push(format!("Rate-limit hits observed: {}", self.state.hits.len()));
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn handle_tasks(store: &dyn RecoveryStore, json_mode: bool) -> Result<()> {
    let active = store.list_active().await?;
    let completed = store.list_completed().await?;
    output(&TasksOutput { active, completed }, json_mode);
    Ok(())
}

pub async fn handle_merge_queue(store: &dyn RecoveryStore, json_mode: bool) -> Result<()> {
    let items = store.read_merge_queue().await?;
    output(&MergeQueueOutput { items }, json_mode);
    Ok(())
}

pub async fn handle_rate_limit(rate_limit: &dyn RateLimitTracker, json_mode: bool) -> Result<()> {
    let state = rate_limit.snapshot().await?;
    output(&RateLimitOutput { state }, json_mode);
    Ok(())
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        text.to_string()
    } else {
        format!("{}...", &text[..max_len.saturating_sub(3)])
    }
}
