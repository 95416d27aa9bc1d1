//! C3: empirical token-usage accounting across two sliding windows (5-hour, 7-day) and
//! proactive pause when usage crosses a safety threshold.
//!
//! Grounded on the teacher's `BudgetTracker` event-emission pattern — here emitting to
//! `tracing` instead of an `EventBus`, since the event-sourcing subsystem is out of scope.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::domain::error::RateLimitError;
use crate::domain::models::{
    ModelPauseState, ModelTier, PauseState, RateLimitHit, RateLimitState, RateLimitTaskUsage,
    TokenUsage,
};
use crate::domain::ports::RateLimitTracker;
use crate::infrastructure::recovery_store::FileRecoveryStore;

const CLEANUP_HORIZON_DAYS: i64 = 8;
const FIVE_HOUR_BUFFER_MINS: i64 = 5;
const WEEKLY_BUFFER_MINS: i64 = 30;
const EXTERNAL_HINT_TTL_MINS: i64 = 5;

fn five_hour_window() -> ChronoDuration {
    ChronoDuration::hours(5)
}

fn weekly_window() -> ChronoDuration {
    ChronoDuration::days(7)
}

/// A percentage-of-limit hint supplied by an upstream source, superseding local
/// estimates for up to 5 minutes.
#[derive(Debug, Clone, Copy)]
struct ExternalHint {
    observed_at: DateTime<Utc>,
    five_hour_pct: f64,
    weekly_pct: f64,
}

pub struct FileRateLimitTracker {
    store: Arc<FileRecoveryStore>,
    guard: Mutex<()>,
    external_hint: Mutex<Option<ExternalHint>>,
}

impl FileRateLimitTracker {
    #[must_use]
    pub fn new(store: Arc<FileRecoveryStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
            external_hint: Mutex::new(None),
        }
    }

    /// Supply an externally observed usage percentage, superseding local estimates for
    /// up to 5 minutes.
    pub async fn apply_external_hint(&self, five_hour_pct: f64, weekly_pct: f64) {
        *self.external_hint.lock().await = Some(ExternalHint {
            observed_at: Utc::now(),
            five_hour_pct,
            weekly_pct,
        });
    }

    fn purge_stale(state: &mut RateLimitState, now: DateTime<Utc>) {
        let horizon = now - ChronoDuration::days(CLEANUP_HORIZON_DAYS);
        state.tasks.retain(|t| t.timestamp >= horizon);
        state.hits.retain(|h| h.timestamp >= horizon);
    }

    fn window_sonnet_eq(state: &RateLimitState, now: DateTime<Utc>, window: ChronoDuration) -> u64 {
        let since = now - window;
        state
            .tasks
            .iter()
            .filter(|t| t.timestamp >= since)
            .map(|t| t.sonnet_equivalent)
            .sum()
    }

    fn oldest_in_window(
        state: &RateLimitState,
        now: DateTime<Utc>,
        window: ChronoDuration,
    ) -> Option<DateTime<Utc>> {
        let since = now - window;
        state
            .tasks
            .iter()
            .filter(|t| t.timestamp >= since)
            .map(|t| t.timestamp)
            .min()
    }

    /// Recompute `state.pause` for `model` from current window totals, entering or
    /// lifting a proactive pause as thresholds dictate.
    fn recompute_pause(state: &mut RateLimitState, model: ModelTier, now: DateTime<Utc>) {
        let key = model.normalize().as_str().to_string();
        let five_hour = Self::window_sonnet_eq(state, now, five_hour_window());
        let weekly = Self::window_sonnet_eq(state, now, weekly_window());

        let five_hour_ratio = five_hour as f64 / state.config.max_tokens_per_5_hours as f64;
        let weekly_ratio = weekly as f64 / state.config.max_tokens_per_week as f64;
        let worst_ratio = five_hour_ratio.max(weekly_ratio);

        if worst_ratio >= state.config.warning_threshold && worst_ratio < 0.95 {
            warn!(model = %key, ratio = worst_ratio, "rate limit warning threshold crossed");
        }

        let entry = state
            .pause
            .model_pauses
            .entry(key.clone())
            .or_insert_with(ModelPauseState::default);

        if worst_ratio >= 0.95 && !entry.is_paused {
            let (offending_window, buffer_mins) = if five_hour_ratio >= weekly_ratio {
                (five_hour_window(), FIVE_HOUR_BUFFER_MINS)
            } else {
                (weekly_window(), WEEKLY_BUFFER_MINS)
            };
            let oldest = Self::oldest_in_window(state, now, offending_window).unwrap_or(now);
            let resume_at = oldest + offending_window + ChronoDuration::minutes(buffer_mins);

            entry.is_paused = true;
            entry.paused_at = Some(now);
            entry.resume_at = Some(resume_at);

            error!(model = %key, reason = "proactive usage threshold", resume_at = %resume_at, "entering proactive pause");
        } else if entry.is_paused
            && five_hour_ratio < state.config.hysteresis_threshold
            && weekly_ratio < state.config.hysteresis_threshold
            && entry.resume_at.is_none_or(|r| now >= r)
        {
            entry.is_paused = false;
            entry.paused_at = None;
            entry.resume_at = None;
        }

        state.pause.is_paused = state.pause.model_pauses.values().any(|p| p.is_paused);
    }
}

#[async_trait]
impl RateLimitTracker for FileRateLimitTracker {
    async fn report_usage(
        &self,
        task_id: &str,
        model: ModelTier,
        tokens: TokenUsage,
        duration_ms: u64,
    ) -> Result<(), RateLimitError> {
        let _lock = self.guard.lock().await;
        let mut state = self.store.read_rate_limit_state().await?;
        let now = Utc::now();

        let multiplier = state.config.token_multipliers.for_model(model);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let sonnet_equivalent = (tokens.total() as f64 * multiplier) as u64;

        state.tasks.push(RateLimitTaskUsage {
            task_id: task_id.to_string(),
            model,
            tokens,
            sonnet_equivalent,
            timestamp: now,
            duration_ms,
        });

        Self::purge_stale(&mut state, now);
        Self::recompute_pause(&mut state, model, now);
        self.store.write_rate_limit_state(&state).await?;
        Ok(())
    }

    async fn report_rate_limited(
        &self,
        model: ModelTier,
        retry_after_secs: Option<u64>,
    ) -> Result<(), RateLimitError> {
        let _lock = self.guard.lock().await;
        let mut state = self.store.read_rate_limit_state().await?;
        let now = Utc::now();

        state.hits.push(RateLimitHit {
            model,
            timestamp: now,
            retry_after_secs,
        });

        let key = model.normalize().as_str().to_string();
        let resume_at = match retry_after_secs {
            Some(secs) => now + ChronoDuration::seconds(secs as i64),
            None => {
                let oldest = Self::oldest_in_window(&state, now, five_hour_window()).unwrap_or(now);
                let estimated = oldest + five_hour_window() + ChronoDuration::minutes(FIVE_HOUR_BUFFER_MINS);
                if estimated > now {
                    estimated
                } else {
                    now + ChronoDuration::hours(1)
                }
            }
        };

        let entry = state
            .pause
            .model_pauses
            .entry(key.clone())
            .or_insert_with(ModelPauseState::default);
        entry.is_paused = true;
        entry.paused_at = Some(now);
        entry.resume_at = Some(resume_at);
        state.pause.is_paused = true;
        state.pause.limited_model = Some(model);
        state.pause.reason = Some("provider 429".to_string());

        error!(model = %key, reason = "observed 429", resume_at = %resume_at, "entering observed pause");

        Self::purge_stale(&mut state, now);
        self.store.write_rate_limit_state(&state).await?;
        Ok(())
    }

    async fn is_paused(&self, model: ModelTier) -> Result<bool, RateLimitError> {
        let state = self.store.read_rate_limit_state().await?;
        let key = model.normalize().as_str();
        Ok(state
            .pause
            .model_pauses
            .get(key)
            .is_some_and(|p| p.is_paused))
    }

    async fn check_auto_resume(&self) -> Result<(), RateLimitError> {
        let _lock = self.guard.lock().await;
        let mut state = self.store.read_rate_limit_state().await?;
        let now = Utc::now();

        let hint = {
            let hint = self.external_hint.lock().await;
            hint.filter(|h| now - h.observed_at <= ChronoDuration::minutes(EXTERNAL_HINT_TTL_MINS))
        };

        let models: Vec<ModelTier> = [ModelTier::Sonnet, ModelTier::Opus].to_vec();
        for model in models {
            if let Some(hint) = hint {
                let key = model.normalize().as_str().to_string();
                let entry = state
                    .pause
                    .model_pauses
                    .entry(key)
                    .or_insert_with(ModelPauseState::default);
                let below_hysteresis = hint.five_hour_pct < state.config.hysteresis_threshold
                    && hint.weekly_pct < state.config.hysteresis_threshold;
                if entry.is_paused && below_hysteresis {
                    entry.is_paused = false;
                    entry.paused_at = None;
                    entry.resume_at = None;
                }
            } else {
                Self::recompute_pause(&mut state, model, now);
            }

            let key = model.normalize().as_str();
            if let Some(entry) = state.pause.model_pauses.get_mut(key) {
                if entry.is_paused && entry.resume_at.is_some_and(|r| now >= r) {
                    entry.is_paused = false;
                    entry.paused_at = None;
                    entry.resume_at = None;
                }
            }
        }

        state.pause.is_paused = state.pause.model_pauses.values().any(|p| p.is_paused);
        if !state.pause.is_paused {
            state.pause.limited_model = None;
            state.pause.reason = None;
        }

        self.store.write_rate_limit_state(&state).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<RateLimitState, RateLimitError> {
        Ok(self.store.read_rate_limit_state().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker() -> (FileRateLimitTracker, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileRecoveryStore::new(dir.path()));
        (FileRateLimitTracker::new(store), dir)
    }

    #[tokio::test]
    async fn usage_accumulates_and_is_not_paused_below_threshold() {
        let (tracker, _dir) = tracker();
        tracker
            .report_usage("t1", ModelTier::Sonnet, TokenUsage { input: 100, output: 100 }, 500)
            .await
            .unwrap();
        assert!(!tracker.is_paused(ModelTier::Sonnet).await.unwrap());
    }

    #[tokio::test]
    async fn crossing_proactive_threshold_pauses_model() {
        let (tracker, _dir) = tracker();
        let huge = TokenUsage {
            input: 3_000_000,
            output: 2_000_000,
        };
        tracker
            .report_usage("t1", ModelTier::Sonnet, huge, 500)
            .await
            .unwrap();
        assert!(tracker.is_paused(ModelTier::Sonnet).await.unwrap());
    }

    #[tokio::test]
    async fn observed_429_with_retry_after_sets_resume_at() {
        let (tracker, _dir) = tracker();
        tracker
            .report_rate_limited(ModelTier::Opus, Some(120))
            .await
            .unwrap();
        let snap = tracker.snapshot().await.unwrap();
        let entry = snap.pause.model_pauses.get("opus").unwrap();
        assert!(entry.is_paused);
        let delta = entry.resume_at.unwrap() - entry.paused_at.unwrap();
        assert_eq!(delta.num_seconds(), 120);
    }

    #[tokio::test]
    async fn check_auto_resume_lifts_expired_pause() {
        let (tracker, _dir) = tracker();
        tracker
            .report_rate_limited(ModelTier::Sonnet, Some(0))
            .await
            .unwrap();
        tracker.check_auto_resume().await.unwrap();
        assert!(!tracker.is_paused(ModelTier::Sonnet).await.unwrap());
    }

    #[tokio::test]
    async fn haiku_usage_normalizes_to_sonnet_pause_key() {
        let (tracker, _dir) = tracker();
        let huge = TokenUsage {
            input: 3_000_000,
            output: 2_000_000,
        };
        tracker
            .report_usage("t1", ModelTier::Haiku, huge, 500)
            .await
            .unwrap();
        assert!(tracker.is_paused(ModelTier::Sonnet).await.unwrap());
    }
}
