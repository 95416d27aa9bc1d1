//! Escalation policy for the task executor (C5): given a failed verification, decide
//! whether to retry on the same model or escalate to the next tier in the ladder.

use std::collections::HashSet;

use crate::domain::models::{ErrorCategory, ModelTier, VerificationResult};

const SAME_MODEL_RETRY_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetrySameModel,
    Escalate,
}

/// Evaluate the escalation rules against one failed verification.
///
/// 1. No files changed at all: the agent is stuck, escalate immediately.
/// 2. Only lint/spell issues: retry same model, escalate after two such retries.
/// 3. Any of typecheck/build/test present: one same-model retry, then escalate.
/// 4. Anything else: escalate after two same-model retries.
#[must_use]
pub fn decide(result: &VerificationResult, same_model_retries: u32) -> Decision {
    if result.files_changed == 0 {
        return Decision::Escalate;
    }

    let categories: HashSet<ErrorCategory> = result.categories();
    let hard_categories = [ErrorCategory::Typecheck, ErrorCategory::Build, ErrorCategory::Test];
    let soft_only = !categories.is_empty()
        && categories
            .iter()
            .all(|c| matches!(c, ErrorCategory::Lint | ErrorCategory::Spell));

    if soft_only {
        return if same_model_retries < SAME_MODEL_RETRY_LIMIT {
            Decision::RetrySameModel
        } else {
            Decision::Escalate
        };
    }

    if categories.iter().any(|c| hard_categories.contains(c)) {
        return if same_model_retries < 1 {
            Decision::RetrySameModel
        } else {
            Decision::Escalate
        };
    }

    if same_model_retries < SAME_MODEL_RETRY_LIMIT {
        Decision::RetrySameModel
    } else {
        Decision::Escalate
    }
}

/// Apply an `Escalate` decision to the current model, returning the next tier if the
/// ladder isn't already exhausted.
#[must_use]
pub fn next_model(current: ModelTier) -> Option<ModelTier> {
    current.escalate()
}
