//! C5: the adaptive-escalation state machine. One Executor runs one task from
//! `starting` to a terminal status, checkpointing after every phase so a crash mid-task
//! resumes from the last-written [`Checkpoint`] rather than from scratch.

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

use crate::domain::error::ExecutorError;
use crate::domain::models::{
    ActiveStatus, ActiveTaskState, Checkpoint, CompletedStatus, CompletedTaskState, LastVerification,
    MergeQueueItem, MergeStatus, ModelTier, Phase, TaskAssignment, TokenUsage,
};
use crate::domain::ports::{
    AgentInvoker, AgentMessage, InvokeRequest, RateLimitTracker, RecoveryStore, ResultSubtype,
    VcsClient, Verifier, WorktreeManager,
};

use super::complexity::{ComplexityAssessor, ComplexityInputs};
use super::escalation::{self, Decision};
use super::scout_cache::{fnv_hash, ContextBriefing, ScoutCache};

const REVIEW_LENSES: &[&str] = &[
    "correctness and edge cases",
    "security and input handling",
    "maintainability and naming",
];

/// A review pass's verdict, parsed from the agent's free-text response.
enum ReviewVerdict {
    NoIssues,
    IssuesFound { fix: String },
}

/// Parses the `NO ISSUES FOUND` / `ISSUES FOUND:` ... `SUGGESTED FIX:` protocol the
/// review prompt asks for. Falls back to treating unparseable text as an issue with
/// the whole response as the fix instruction, since silence should never be read as
/// convergence.
fn parse_review_verdict(text: &str) -> ReviewVerdict {
    if text.contains("NO ISSUES FOUND") {
        return ReviewVerdict::NoIssues;
    }
    let fix = match text.find("SUGGESTED FIX:") {
        Some(idx) => text[idx + "SUGGESTED FIX:".len()..].trim().to_string(),
        None => text.trim().to_string(),
    };
    ReviewVerdict::IssuesFound { fix }
}

pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub max_review_passes_per_tier: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            max_review_passes_per_tier: 2,
        }
    }
}

pub struct TaskExecutor {
    invoker: Arc<dyn AgentInvoker>,
    verifier: Arc<dyn Verifier>,
    vcs: Arc<dyn VcsClient>,
    store: Arc<dyn RecoveryStore>,
    rate_limit: Arc<dyn RateLimitTracker>,
    worktrees: Arc<dyn WorktreeManager>,
    scout_cache: Arc<ScoutCache>,
    complexity: ComplexityAssessor,
    config: ExecutorConfig,
}

impl TaskExecutor {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        verifier: Arc<dyn Verifier>,
        vcs: Arc<dyn VcsClient>,
        store: Arc<dyn RecoveryStore>,
        rate_limit: Arc<dyn RateLimitTracker>,
        worktrees: Arc<dyn WorktreeManager>,
        scout_cache: Arc<ScoutCache>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            invoker,
            verifier,
            vcs,
            store,
            rate_limit,
            worktrees,
            scout_cache,
            complexity: ComplexityAssessor::new(),
            config,
        }
    }

    async fn checkpoint(&self, assignment: &TaskAssignment, checkpoint: Checkpoint) -> Result<(), ExecutorError> {
        let active = ActiveTaskState {
            task_id: assignment.task_id.clone(),
            objective: assignment.objective.clone(),
            worktree_path: assignment.worktree_path.clone(),
            branch: assignment.branch.clone(),
            status: ActiveStatus::Running,
            batch_id: assignment.batch_id.clone(),
            started_at: Some(assignment.assigned_at),
            previous_checkpoint: Some(checkpoint),
            pid: Some(std::process::id()),
            last_updated: Utc::now(),
        };
        self.store.write_active(&active).await?;
        Ok(())
    }

    /// Run one task to a terminal state: `complete`, `merged` (handed to C7), or `failed`.
    pub async fn run_task(&self, assignment: TaskAssignment) -> Result<CompletedTaskState, ExecutorError> {
        let worktree = assignment.worktree_path.clone();

        // starting
        let _ = self.vcs.reset_hard_clean(&worktree).await;
        let mut model = assignment.model;
        let mut attempts = 0u32;
        let mut same_model_retries = 0u32;
        let mut checkpoint = Checkpoint::starting(model);
        self.checkpoint(&assignment, checkpoint.clone()).await?;

        // context
        let briefing = self.build_briefing(&assignment).await;
        let target_files: Vec<std::path::PathBuf> = briefing.target_files.iter().map(std::path::PathBuf::from).collect();
        let complexity = self
            .complexity
            .assess(&ComplexityInputs {
                objective: &assignment.objective,
                target_files: &target_files,
                worktree: &worktree,
            })
            .await;
        let multi_lens = complexity.wants_multi_lens();

        let mut retry_context: Option<String> = None;
        let mut post_mortem: Option<String> = None;

        loop {
            attempts += 1;
            checkpoint.phase = Phase::Executing;
            checkpoint.model = model;
            checkpoint.attempts = attempts;
            checkpoint.saved_at = Utc::now();
            self.checkpoint(&assignment, checkpoint.clone()).await?;

            if attempts > self.config.max_attempts {
                return self.fail_task(&assignment, "max attempts exhausted").await;
            }

            let prompt = build_prompt(&briefing, &assignment.objective, retry_context.as_deref(), post_mortem.as_deref());
            post_mortem = None;

            let invoke_result = self.invoke(model, &prompt, &worktree).await;
            match invoke_result {
                Ok(_) => {}
                Err(ExecutorError::Agent(crate::domain::error::AgentInvokerError::RateLimited { retry_after_secs })) => {
                    let _ = self.rate_limit.report_rate_limited(model, retry_after_secs).await;
                    return Err(ExecutorError::Agent(crate::domain::error::AgentInvokerError::RateLimited {
                        retry_after_secs,
                    }));
                }
                Err(e) => return Err(e),
            };

            // verifying
            checkpoint.phase = Phase::Verifying;
            self.checkpoint(&assignment, checkpoint.clone()).await?;
            let verification = self
                .verifier
                .verify(&worktree)
                .await
                .map_err(ExecutorError::Verifier)?;

            checkpoint.last_verification = Some(LastVerification {
                passed: verification.passed,
                errors: verification.issues.iter().map(|i| i.message.clone()).collect(),
            });
            self.checkpoint(&assignment, checkpoint.clone()).await?;

            if verification.passed {
                // reviewing (optional)
                if assignment.review_passes {
                    checkpoint.phase = Phase::Reviewing;
                    self.checkpoint(&assignment, checkpoint.clone()).await?;
                    match self.run_review_ladder(&assignment, model, &worktree, &briefing, multi_lens).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // review broke verification; retry executing with review notes
                            retry_context = Some("a review pass introduced a regression; re-verify and fix".to_string());
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }

                // committing
                checkpoint.phase = Phase::Committing;
                self.checkpoint(&assignment, checkpoint.clone()).await?;
                let commit_sha = if assignment.auto_commit && verification.files_changed > 0 {
                    let _ = self.vcs.add_all(&worktree).await;
                    self.vcs
                        .commit(&worktree, &format!("{}\n\nAutomated commit.", assignment.objective))
                        .await
                        .ok()
                } else {
                    None
                };

                let diff_base = if commit_sha.is_some() { "HEAD~1" } else { "HEAD" };
                let modified_files = self
                    .vcs
                    .diff_name_only(&worktree, diff_base)
                    .await
                    .unwrap_or_default();

                return self
                    .complete_task(&assignment, commit_sha, modified_files)
                    .await;
            }

            // escalation policy
            let decision = escalation::decide(&verification, same_model_retries);
            match decision {
                Decision::RetrySameModel => {
                    same_model_retries += 1;
                    retry_context = Some(verification.feedback.clone());
                }
                Decision::Escalate => {
                    post_mortem = self.post_mortem(&assignment, &verification).await;
                    match escalation::next_model(model) {
                        Some(next) => {
                            model = next;
                            same_model_retries = 0;
                            retry_context = Some(verification.feedback.clone());
                        }
                        None => {
                            return self.fail_task(&assignment, &verification.feedback).await;
                        }
                    }
                }
            }
        }
    }

    async fn invoke(&self, model: ModelTier, prompt: &str, cwd: &std::path::Path) -> Result<(TokenUsage, String), ExecutorError> {
        let started = Instant::now();
        let mut stream = self
            .invoker
            .invoke(InvokeRequest {
                model,
                prompt: prompt.to_string(),
                cwd: cwd.to_path_buf(),
                max_turns: None,
            })
            .await
            .map_err(ExecutorError::Agent)?;

        let mut tokens = TokenUsage::default();
        let mut text = String::new();
        while let Some(message) = stream.next().await {
            match message {
                Ok(AgentMessage::Result { subtype, tokens: reported, text: reported_text }) => {
                    tokens = reported;
                    text = reported_text;
                    if subtype == ResultSubtype::Error {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(ExecutorError::Agent(e)),
            }
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let _ = self
            .rate_limit
            .report_usage("task", model, tokens, duration_ms)
            .await;
        Ok((tokens, text))
    }

    async fn build_briefing(&self, assignment: &TaskAssignment) -> ContextBriefing {
        let fingerprint = self
            .vcs
            .rev_parse_head(&assignment.worktree_path)
            .await
            .unwrap_or_default();
        let fingerprint_hash = fnv_hash(&fingerprint);
        let goal_hash = fnv_hash(&assignment.objective);

        if let Some(hit) = self.scout_cache.get(fingerprint_hash, goal_hash).await {
            return hit;
        }

        let target_files = self
            .vcs
            .diff_name_only(&assignment.worktree_path, "HEAD")
            .await
            .unwrap_or_default();

        let briefing = ContextBriefing {
            target_files,
            fingerprint,
            last_used_at: Utc::now(),
        };
        self.scout_cache.put(fingerprint_hash, goal_hash, briefing.clone()).await;
        briefing
    }

    /// Single-turn call on the cheapest tier summarizing the failure, attached to the
    /// next prompt. Never blocks escalation if it fails.
    async fn post_mortem(&self, assignment: &TaskAssignment, verification: &crate::domain::models::VerificationResult) -> Option<String> {
        let prompt = format!(
            "In 2-4 sentences: given this verifier feedback for the objective \"{}\", what approach was likely taken, why did it fail, and what should be tried next?\n\n{}",
            assignment.objective, verification.feedback
        );
        let (_, text) = self
            .invoke(ModelTier::Sonnet, &prompt, &assignment.worktree_path)
            .await
            .ok()?;
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Returns `Ok(true)` if the review ladder converged without breaking verification,
    /// `Ok(false)` if a review-induced fix broke verification and the caller should
    /// return to `executing` with review notes as retry context.
    async fn run_review_ladder(
        &self,
        assignment: &TaskAssignment,
        model: ModelTier,
        worktree: &std::path::Path,
        briefing: &ContextBriefing,
        multi_lens: bool,
    ) -> Result<bool, ExecutorError> {
        let tiers = [ModelTier::Sonnet, ModelTier::Opus];
        let start_idx = tiers.iter().position(|t| *t == model.normalize()).unwrap_or(0);

        for tier in &tiers[start_idx..] {
            for _ in 0..self.config.max_review_passes_per_tier {
                let prompt = format!(
                    "Review the current changes for \"{}\" against: {}\nRespond with either `NO ISSUES FOUND` or `ISSUES FOUND:` followed by `SUGGESTED FIX:`.",
                    assignment.objective, briefing.fingerprint
                );
                let (_, text) = self.invoke(*tier, &prompt, worktree).await?;

                match parse_review_verdict(&text) {
                    ReviewVerdict::NoIssues => break,
                    ReviewVerdict::IssuesFound { fix } => {
                        let fix_prompt = format!("Apply this fix:\n\n{fix}");
                        let _ = self.invoke(*tier, &fix_prompt, worktree).await?;
                        let reverification =
                            self.verifier.verify(worktree).await.map_err(ExecutorError::Verifier)?;
                        if !reverification.passed {
                            return Ok(false);
                        }
                    }
                }
            }

            // Advisory multi-lens runs at opus but never blocks convergence.
            if *tier == ModelTier::Opus && multi_lens {
                for lens in REVIEW_LENSES {
                    let lens_prompt = format!(
                        "Advisory review of \"{}\" through the lens of {lens}. Report insights only.",
                        assignment.objective
                    );
                    let _ = self.invoke(ModelTier::Opus, &lens_prompt, worktree).await?;
                }
            }
        }

        let reverification = self.verifier.verify(worktree).await.map_err(ExecutorError::Verifier)?;
        Ok(reverification.passed)
    }

    async fn enqueue_merge(&self, assignment: &TaskAssignment, modified_files: Vec<String>) -> Result<(), ExecutorError> {
        let mut queue = self.store.read_merge_queue().await?;
        queue.push(MergeQueueItem {
            branch: assignment.branch.clone(),
            task_id: assignment.task_id.clone(),
            agent_id: assignment.task_id.clone(),
            status: MergeStatus::Pending,
            queued_at: Utc::now(),
            completed_at: None,
            modified_files,
            retry_count: 0,
            max_retries: 3,
            next_retry_after: None,
            original_error: None,
            is_retry: false,
            strategy_used: None,
            duration_ms: None,
        });
        self.store.write_merge_queue(&queue).await?;
        Ok(())
    }

    async fn complete_task(
        &self,
        assignment: &TaskAssignment,
        commit_sha: Option<String>,
        modified_files: Vec<String>,
    ) -> Result<CompletedTaskState, ExecutorError> {
        self.enqueue_merge(assignment, modified_files.clone()).await?;

        let completed = CompletedTaskState {
            task_id: assignment.task_id.clone(),
            objective: assignment.objective.clone(),
            status: CompletedStatus::Complete,
            batch_id: assignment.batch_id.clone(),
            completed_at: Utc::now(),
            error: None,
            modified_files,
            commit_sha,
            last_updated: Utc::now(),
        };
        self.store.complete_task(&assignment.task_id, &completed).await?;
        let _ = self.worktrees.release(&assignment.task_id, false).await;
        Ok(completed)
    }

    async fn fail_task(&self, assignment: &TaskAssignment, reason: &str) -> Result<CompletedTaskState, ExecutorError> {
        let _ = self.vcs.reset_hard_clean(&assignment.worktree_path).await;
        let _ = self.worktrees.release(&assignment.task_id, true).await;

        let completed = CompletedTaskState {
            task_id: assignment.task_id.clone(),
            objective: assignment.objective.clone(),
            status: CompletedStatus::Failed,
            batch_id: assignment.batch_id.clone(),
            completed_at: Utc::now(),
            error: Some(reason.to_string()),
            modified_files: Vec::new(),
            commit_sha: None,
            last_updated: Utc::now(),
        };
        self.store.complete_task(&assignment.task_id, &completed).await?;
        Ok(completed)
    }
}

fn build_prompt(
    briefing: &ContextBriefing,
    objective: &str,
    retry_context: Option<&str>,
    post_mortem: Option<&str>,
) -> String {
    let mut parts = vec![format!(
        "Target files (by briefing): {}",
        briefing.target_files.join(", ")
    )];
    parts.push(objective.to_string());
    if let Some(retry) = retry_context {
        parts.push(format!("Previous attempt's verifier feedback:\n{retry}"));
    }
    if let Some(post_mortem) = post_mortem {
        parts.push(format!("Post-mortem from the prior tier:\n{post_mortem}"));
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_all_optional_sections() {
        let briefing = ContextBriefing {
            target_files: vec!["src/lib.rs".to_string()],
            fingerprint: "abc".to_string(),
            last_used_at: Utc::now(),
        };
        let prompt = build_prompt(&briefing, "fix the bug", Some("lint failed"), Some("tried X, failed because Y"));
        assert!(prompt.contains("fix the bug"));
        assert!(prompt.contains("lint failed"));
        assert!(prompt.contains("tried X"));
    }

    #[test]
    fn review_verdict_recognizes_no_issues() {
        let text = "I looked at the diff.\nNO ISSUES FOUND";
        assert!(matches!(parse_review_verdict(text), ReviewVerdict::NoIssues));
    }

    #[test]
    fn review_verdict_extracts_suggested_fix() {
        let text = "ISSUES FOUND:\nThe error path drops context.\nSUGGESTED FIX:\nWrap the error with `.context(...)`.";
        match parse_review_verdict(text) {
            ReviewVerdict::IssuesFound { fix } => assert_eq!(fix, "Wrap the error with `.context(...)`."),
            ReviewVerdict::NoIssues => panic!("expected issues to be found"),
        }
    }

    #[test]
    fn review_verdict_treats_unparseable_text_as_an_issue() {
        let text = "the agent rambled without following the protocol";
        match parse_review_verdict(text) {
            ReviewVerdict::IssuesFound { fix } => assert_eq!(fix, text),
            ReviewVerdict::NoIssues => panic!("unparseable text must not be treated as convergence"),
        }
    }
}
