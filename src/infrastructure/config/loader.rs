//! Hierarchical config loading: programmatic defaults -> `.engine/config.yaml` ->
//! `.engine/local.yaml` -> `ENGINE_`-prefixed environment variables.

use crate::domain::error::ConfigError;
use crate::domain::models::{RateLimitThresholds, TokenMultipliers};
use crate::infrastructure::logging::config::LogConfig;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub typecheck_cmd: Option<String>,
    pub lint_cmd: Option<String>,
    pub test_cmd: Option<String>,
    pub build_cmd: Option<String>,
    pub spell_cmd: Option<String>,
    pub code_health_cmd: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            typecheck_cmd: None,
            lint_cmd: None,
            test_cmd: None,
            build_cmd: None,
            spell_cmd: None,
            code_health_cmd: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueConfigEngine {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub overlap_warning_files: u32,
    pub overlap_error_files: u32,
}

impl Default for MergeQueueConfigEngine {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            overlap_warning_files: 2,
            overlap_error_files: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    pub max_preserved_failed: u32,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            max_preserved_failed: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    Anthropic,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateConfig {
    pub kind: SubstrateKind,
    pub api_key_env_var: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            kind: SubstrateKind::Anthropic,
            api_key_env_var: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub max_concurrent: u32,
    pub scheduler_poll_interval_secs: u64,
    pub graceful_shutdown_secs: u64,
    pub verifier: VerifierConfig,
    pub rate_limit: RateLimitThresholds,
    pub merge_queue: MergeQueueConfigEngine,
    pub worktree: WorktreeConfig,
    pub logging: LogConfig,
    pub substrate: SubstrateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".engine-state"),
            max_concurrent: 4,
            scheduler_poll_interval_secs: 5,
            graceful_shutdown_secs: 60,
            verifier: VerifierConfig::default(),
            rate_limit: RateLimitThresholds::default(),
            merge_queue: MergeQueueConfigEngine::default(),
            worktree: WorktreeConfig::default(),
            logging: LogConfig::default(),
            substrate: SubstrateConfig::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults, `.engine/config.yaml`, `.engine/local.yaml`, and
    /// `ENGINE_`-prefixed environment variables (double-underscore separated for nesting),
    /// in that order of increasing precedence.
    pub fn load() -> Result<EngineConfig, ConfigError> {
        let base = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(".engine/config.yaml"))
            .merge(Yaml::file(".engine/local.yaml"))
            .merge(Env::prefixed("ENGINE_").split("__"));

        let config: EngineConfig = base.extract()?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
        if config.max_concurrent < 1 {
            return Err(ConfigError::InvalidMaxConcurrent(config.max_concurrent));
        }
        if config.merge_queue.backoff_base_ms > config.merge_queue.backoff_cap_ms {
            return Err(ConfigError::InvalidBackoff(
                config.merge_queue.backoff_base_ms,
                config.merge_queue.backoff_cap_ms,
            ));
        }
        if !(0.0..=1.0).contains(&config.rate_limit.warning_threshold) {
            return Err(ConfigError::InvalidWarningThreshold(
                config.rate_limit.warning_threshold,
            ));
        }
        Self::validate_multipliers(&config.rate_limit.token_multipliers)?;
        Ok(())
    }

    fn validate_multipliers(multipliers: &TokenMultipliers) -> Result<(), ConfigError> {
        for (model, value) in [("sonnet", multipliers.sonnet), ("opus", multipliers.opus)] {
            if value <= 0.0 {
                return Err(ConfigError::InvalidTokenMultiplier {
                    model: model.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = EngineConfig::default();
        config.max_concurrent = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConcurrent(0))
        ));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut config = EngineConfig::default();
        config.merge_queue.backoff_base_ms = 5_000;
        config.merge_queue.backoff_cap_ms = 1_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(_, _))
        ));
    }

    #[test]
    fn rejects_non_positive_multiplier() {
        let mut config = EngineConfig::default();
        config.rate_limit.token_multipliers.opus = 0.0;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn env_override_applies() {
        temp_env::with_var("ENGINE_MAX_CONCURRENT", Some("9"), || {
            let config = ConfigLoader::load().expect("load");
            assert_eq!(config.max_concurrent, 9);
        });
    }
}
