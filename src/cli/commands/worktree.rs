//! `engine worktree` — inspect and prune isolated Git worktrees.

use anyhow::Result;
use comfy_table::{presets, Attribute, Cell, ContentArrangement, Table};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::services::worktree_manager::WorktreeMeta;
use crate::services::GitWorktreeManager;

#[derive(Serialize)]
pub struct WorktreeListOutput {
    pub active: Vec<WorktreeMetaView>,
    pub preserved: Vec<WorktreeMetaView>,
}

#[derive(Serialize)]
pub struct WorktreeMetaView {
    pub task_id: String,
    pub branch: String,
    pub error: Option<String>,
}

impl From<&WorktreeMeta> for WorktreeMetaView {
    fn from(meta: &WorktreeMeta) -> Self {
        Self {
            task_id: meta.task_id.clone(),
            branch: meta.branch.clone(),
            error: meta.error.clone(),
        }
    }
}

impl CommandOutput for WorktreeListOutput {
    fn to_human(&self) -> String {
        if self.active.is_empty() && self.preserved.is_empty() {
            return "No worktrees.".to_string();
        }
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Task").add_attribute(Attribute::Bold),
                Cell::new("Branch").add_attribute(Attribute::Bold),
                Cell::new("State").add_attribute(Attribute::Bold),
                Cell::new("Error").add_attribute(Attribute::Bold),
            ]);
        for meta in &self.active {
            table.add_row(vec![
                meta.task_id.clone(),
                meta.branch.clone(),
                "active".to_string(),
                meta.error.clone().unwrap_or_default(),
            ]);
        }
        for meta in &self.preserved {
            table.add_row(vec![
                meta.task_id.clone(),
                meta.branch.clone(),
                "preserved".to_string(),
                meta.error.clone().unwrap_or_default(),
            ]);
        }
        table.to_string()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Serialize)]
pub struct PruneOutput {
    pub removed: usize,
}

impl CommandOutput for PruneOutput {
    fn to_human(&self) -> String {
        format!("Pruned {} preserved worktree(s)", self.removed)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn handle_list(worktrees: &GitWorktreeManager, json_mode: bool) -> Result<()> {
    let active = worktrees.list_active().await?;
    let preserved = worktrees.list_preserved().await?;
    output(
        &WorktreeListOutput {
            active: active.iter().map(WorktreeMetaView::from).collect(),
            preserved: preserved.iter().map(WorktreeMetaView::from).collect(),
        },
        json_mode,
    );
    Ok(())
}

pub async fn handle_prune(worktrees: &GitWorktreeManager) -> Result<()> {
    let removed = worktrees.prune().await?;
    output(&PruneOutput { removed }, false);
    Ok(())
}
