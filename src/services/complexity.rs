//! Cheap, LLM-free heuristic that labels a task's difficulty before spending any tokens
//! on it. The label picks a starting model and whether multi-lens review is worthwhile.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::domain::models::Complexity;

const CRITICAL_KEYWORDS: &[&str] = &[
    "security", "auth", "authentication", "credential", "payment", "encryption", "migration",
];
const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor", "rewrite", "architecture", "redesign", "across", "concurrency", "race",
];
const TRIVIAL_KEYWORDS: &[&str] = &["typo", "rename", "bump version", "comment", "formatting"];

const CHURN_WINDOW_DAYS: u64 = 7;

/// What a task executor knows before calling the agent: the objective text and the
/// set of files the objective is expected to touch.
pub struct ComplexityInputs<'a> {
    pub objective: &'a str,
    pub target_files: &'a [PathBuf],
    pub worktree: &'a Path,
}

/// Cheap keyword + structural heuristic labelling task difficulty `trivial..critical`.
pub struct ComplexityAssessor;

impl ComplexityAssessor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    pub async fn assess(&self, inputs: &ComplexityInputs<'_>) -> Complexity {
        let objective_lower = inputs.objective.to_lowercase();

        if CRITICAL_KEYWORDS.iter().any(|k| objective_lower.contains(k)) {
            return Complexity::Critical;
        }

        let mut score: i32 = 0;

        if COMPLEX_KEYWORDS.iter().any(|k| objective_lower.contains(k)) {
            score += 2;
        }
        if TRIVIAL_KEYWORDS.iter().any(|k| objective_lower.contains(k)) {
            score -= 2;
        }

        score += match inputs.target_files.len() {
            0..=1 => 0,
            2..=4 => 1,
            5..=10 => 2,
            _ => 3,
        };

        let packages = distinct_top_level_dirs(inputs.target_files);
        score += match packages {
            0..=1 => 0,
            2 => 1,
            _ => 2,
        };

        score += aggregate_size_score(inputs.worktree, inputs.target_files).await;
        score += churn_score(inputs.worktree, inputs.target_files).await;

        match score {
            i32::MIN..=0 => Complexity::Trivial,
            1 => Complexity::Simple,
            2..=3 => Complexity::Standard,
            4..=5 => Complexity::Complex,
            _ => Complexity::Critical,
        }
    }
}

impl Default for ComplexityAssessor {
    fn default() -> Self {
        Self::new()
    }
}

fn distinct_top_level_dirs(files: &[PathBuf]) -> usize {
    files
        .iter()
        .filter_map(|p| p.components().next())
        .collect::<std::collections::HashSet<_>>()
        .len()
}

async fn aggregate_size_score(worktree: &Path, files: &[PathBuf]) -> i32 {
    let mut total = 0u64;
    for file in files {
        if let Ok(meta) = tokio::fs::metadata(worktree.join(file)).await {
            total += meta.len();
        }
    }
    match total {
        0..=20_000 => 0,
        20_001..=100_000 => 1,
        _ => 2,
    }
}

/// Proxy for "recent VCS churn hotspots": files whose mtime falls inside the last
/// week score higher, on the assumption that recently touched code is less settled.
async fn churn_score(worktree: &Path, files: &[PathBuf]) -> i32 {
    let now = SystemTime::now();
    let window = std::time::Duration::from_secs(CHURN_WINDOW_DAYS * 24 * 3600);
    let mut recent = 0;
    for file in files {
        if let Ok(meta) = tokio::fs::metadata(worktree.join(file)).await {
            if let Ok(modified) = meta.modified() {
                if now.duration_since(modified).map(|d| d < window).unwrap_or(false) {
                    recent += 1;
                }
            }
        }
    }
    match recent {
        0 => 0,
        1..=2 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn security_keyword_is_always_critical() {
        let assessor = ComplexityAssessor::new();
        let inputs = ComplexityInputs {
            objective: "patch an authentication bypass",
            target_files: &[],
            worktree: Path::new("/tmp"),
        };
        assert_eq!(assessor.assess(&inputs).await, Complexity::Critical);
    }

    #[tokio::test]
    async fn trivial_rename_with_one_file_is_trivial() {
        let assessor = ComplexityAssessor::new();
        let inputs = ComplexityInputs {
            objective: "rename a variable for clarity",
            target_files: &[PathBuf::from("src/lib.rs")],
            worktree: Path::new("/tmp"),
        };
        assert_eq!(assessor.assess(&inputs).await, Complexity::Trivial);
    }

    #[tokio::test]
    async fn wide_refactor_across_many_files_escalates() {
        let assessor = ComplexityAssessor::new();
        let files: Vec<PathBuf> = (0..12)
            .map(|n| PathBuf::from(format!("pkg{n}/src/lib.rs")))
            .collect();
        let inputs = ComplexityInputs {
            objective: "refactor the module layout across the workspace",
            target_files: &files,
            worktree: Path::new("/tmp"),
        };
        assert!(matches!(
            assessor.assess(&inputs).await,
            Complexity::Complex | Complexity::Critical
        ));
    }
}
