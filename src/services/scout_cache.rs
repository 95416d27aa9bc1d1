//! Free (no-LLM-cost) context briefing cache for the task executor's `context` phase.
//! Keyed by `(fingerprintHash, goalHash)`; entries older than 30 days are treated as
//! misses, and the cache is kept at or below 100 entries by evicting the
//! least-recently-used. Backed by the Recovery Store's `scout-cache.json` so a
//! restart doesn't throw away briefings that are still within their TTL.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::models::ScoutCacheEntry;
use crate::domain::ports::RecoveryStore;

const MAX_ENTRIES: usize = 100;
const TTL_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct ContextBriefing {
    pub target_files: Vec<String>,
    pub fingerprint: String,
    pub last_used_at: DateTime<Utc>,
}

pub struct ScoutCache {
    store: Arc<dyn RecoveryStore>,
    entries: Mutex<HashMap<(u64, u64), ContextBriefing>>,
}

impl ScoutCache {
    #[must_use]
    pub fn new(store: Arc<dyn RecoveryStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Populate the in-memory cache from disk, dropping anything already past its
    /// TTL. Call once at startup; a failure to read just starts the cache cold.
    pub async fn load(&self) {
        let persisted = match self.store.read_scout_cache().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to load scout cache, starting cold");
                return;
            }
        };
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        for entry in persisted {
            if now - entry.last_used_at > Duration::days(TTL_DAYS) {
                continue;
            }
            entries.insert(
                (entry.fingerprint_hash, entry.goal_hash),
                ContextBriefing {
                    target_files: entry.target_files,
                    fingerprint: entry.fingerprint,
                    last_used_at: entry.last_used_at,
                },
            );
        }
    }

    pub async fn get(&self, fingerprint_hash: u64, goal_hash: u64) -> Option<ContextBriefing> {
        let mut entries = self.entries.lock().await;
        let key = (fingerprint_hash, goal_hash);
        let hit = entries.get(&key)?.clone();
        if Utc::now() - hit.last_used_at > Duration::days(TTL_DAYS) {
            entries.remove(&key);
            self.persist(&entries).await;
            return None;
        }
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used_at = Utc::now();
        }
        self.persist(&entries).await;
        Some(hit)
    }

    pub async fn put(&self, fingerprint_hash: u64, goal_hash: u64, briefing: ContextBriefing) {
        let mut entries = self.entries.lock().await;
        entries.insert((fingerprint_hash, goal_hash), briefing);

        if entries.len() > MAX_ENTRIES {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.last_used_at)
                .map(|(k, _)| *k)
            {
                entries.remove(&oldest_key);
            }
        }
        self.persist(&entries).await;
    }

    async fn persist(&self, entries: &HashMap<(u64, u64), ContextBriefing>) {
        let snapshot: Vec<ScoutCacheEntry> = entries
            .iter()
            .map(|((fingerprint_hash, goal_hash), briefing)| ScoutCacheEntry {
                fingerprint_hash: *fingerprint_hash,
                goal_hash: *goal_hash,
                target_files: briefing.target_files.clone(),
                fingerprint: briefing.fingerprint.clone(),
                last_used_at: briefing.last_used_at,
            })
            .collect();
        if let Err(e) = self.store.write_scout_cache(&snapshot).await {
            warn!(error = %e, "failed to persist scout cache");
        }
    }
}

/// FNV-1a over arbitrary bytes, used for both the fingerprint and goal hash.
#[must_use]
pub fn fnv_hash(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::recovery_store::store::FileRecoveryStore;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> ScoutCache {
        ScoutCache::new(Arc::new(FileRecoveryStore::new(dir.path())))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let briefing = ContextBriefing {
            target_files: vec!["src/lib.rs".to_string()],
            fingerprint: "abc123".to_string(),
            last_used_at: Utc::now(),
        };
        cache.put(1, 2, briefing.clone()).await;
        let hit = cache.get(1, 2).await.unwrap();
        assert_eq!(hit.fingerprint, briefing.fingerprint);
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert!(cache.get(999, 999).await.is_none());
    }

    #[tokio::test]
    async fn evicts_least_recently_used_beyond_capacity() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        for i in 0..MAX_ENTRIES as u64 + 1 {
            cache
                .put(
                    i,
                    0,
                    ContextBriefing {
                        target_files: vec![],
                        fingerprint: i.to_string(),
                        last_used_at: Utc::now() - Duration::seconds((MAX_ENTRIES as i64 + 1) - i as i64),
                    },
                )
                .await;
        }
        assert!(cache.get(0, 0).await.is_none());
    }

    #[tokio::test]
    async fn load_restores_entries_from_a_prior_process() {
        let dir = TempDir::new().unwrap();
        {
            let cache = cache(&dir);
            cache
                .put(
                    1,
                    2,
                    ContextBriefing {
                        target_files: vec!["src/main.rs".to_string()],
                        fingerprint: "xyz".to_string(),
                        last_used_at: Utc::now(),
                    },
                )
                .await;
        }

        let restarted = cache(&dir);
        assert!(restarted.get(1, 2).await.is_none());
        restarted.load().await;
        let hit = restarted.get(1, 2).await.unwrap();
        assert_eq!(hit.fingerprint, "xyz");
    }

    #[tokio::test]
    async fn load_drops_entries_past_ttl() {
        let dir = TempDir::new().unwrap();
        {
            let cache = cache(&dir);
            cache
                .put(
                    1,
                    2,
                    ContextBriefing {
                        target_files: vec![],
                        fingerprint: "stale".to_string(),
                        last_used_at: Utc::now() - Duration::days(TTL_DAYS + 1),
                    },
                )
                .await;
        }

        let restarted = cache(&dir);
        restarted.load().await;
        assert!(restarted.get(1, 2).await.is_none());
    }
}
