//! Configuration system for Distill.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.
//! Configuration is loaded from `~/.config/distill/config.toml` and/or
//! `.distill/config.toml` in the workspace directory.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the research pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistillConfig {
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Model identifiers passed to the LLM provider for each kind of call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model used to score relevance of each search result.
    pub relevance: String,
    /// Model used for per-subtopic narratives and key findings.
    pub synthesis: String,
    /// Model used for the executive summary.
    pub summary: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            relevance: "gpt-4o-mini".to_string(),
            synthesis: "gpt-4o".to_string(),
            summary: "gpt-4o".to_string(),
        }
    }
}

/// Relevance filtering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceConfig {
    /// Minimum score (1-10) for a result to be kept.
    pub threshold: u8,
    /// Characters of content shown to the relevance model.
    pub max_content_chars: usize,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            threshold: 8,
            max_content_chars: 1000,
        }
    }
}

/// Output-size limits for synthesized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Upper bound on the length of each narrative and of the executive summary.
    pub max_output_chars: usize,
    /// Characters of each relevant item included in a synthesis prompt.
    pub max_content_chars_per_item: usize,
    /// Upper bound on the number of key findings.
    pub max_key_findings: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 4000,
            max_content_chars_per_item: 3000,
            max_key_findings: 10,
        }
    }
}

/// Limits on concurrent external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum LLM calls in flight at once, across all pipeline stages.
    pub max_concurrent_calls: usize,
    /// Timeout for a single LLM call attempt, in seconds.
    pub call_timeout_secs: u64,
    /// Requests per minute (0 = unlimited).
    #[serde(default)]
    pub requests_per_minute: usize,
    /// Estimated input tokens per minute (0 = unlimited).
    #[serde(default)]
    pub input_tokens_per_minute: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            call_timeout_secs: 60,
            requests_per_minute: 0,
            input_tokens_per_minute: 0,
        }
    }
}

impl ConcurrencyConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Research result cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entries older than this are treated as misses.
    pub ttl_hours: u64,
    /// Directory for cache entries. Defaults to the platform cache dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: 24,
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }

    /// Resolve the cache directory: explicit setting, then the platform
    /// cache dir, then `./data/cache`.
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "distill", "distill")
            .map(|d| d.cache_dir().join("research"))
            .unwrap_or_else(|| PathBuf::from("./data/cache"))
    }
}

/// Retry settings for external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay after each failed attempt; the last value is reused when
    /// `max_attempts` exceeds the list.
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays_ms: vec![1000, 3000, 5000],
        }
    }
}

impl DistillConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.relevance.threshold) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "relevance.threshold must be between 1 and 10, got {}",
                    self.relevance.threshold
                ),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.concurrency.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid {
                message: "concurrency.max_concurrent_calls must be at least 1".to_string(),
            });
        }
        if self.concurrency.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "concurrency.call_timeout_secs must be positive".to_string(),
            });
        }
        if self.cache.enabled && self.cache.ttl_hours == 0 {
            return Err(ConfigError::Invalid {
                message: "cache.ttl_hours must be positive when the cache is enabled".to_string(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DISTILL_`)
/// 3. Workspace-local config (`.distill/config.toml`)
/// 4. User config (`~/.config/distill/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DistillConfig>,
) -> Result<DistillConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(DistillConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "distill", "distill") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".distill").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DISTILL_RELEVANCE__THRESHOLD, DISTILL_CACHE__TTL_HOURS, etc.
    figment = figment.merge(Env::prefixed("DISTILL_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: DistillConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
