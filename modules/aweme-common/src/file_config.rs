use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// TOML-backed tunables loaded from disk.
/// Secrets (cookies, database URL) stay as env vars.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub schema: SchemaConfig,
}

/// Selects a built-in pacing profile and optionally overrides parts of it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PacingConfig {
    /// `classic` or `smoothed`.
    pub profile: String,
    /// Visit-count thresholds, largest first. Sleep is twice the threshold.
    pub checkpoints: Option<Vec<u64>>,
    pub default_sleep_secs: Option<f64>,
    /// Uniform jitter factor bounds, `[low, high]`.
    pub jitter: Option<[f64; 2]>,
    pub idle_reset_secs: Option<u64>,
    /// Minimum span covered by the last five scheduled visits.
    pub burst_floor_secs: Option<u64>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            profile: "classic".to_string(),
            checkpoints: None,
            default_sleep_secs: None,
            jitter: None,
            idle_reset_secs: None,
            burst_floor_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Cooldown after connection refused / timeout.
    pub connectivity_cooldown_secs: u64,
    /// `None` retries connectivity loss forever.
    pub connectivity_max_attempts: Option<u32>,
    /// Cooldown after connection pool exhaustion.
    pub exhaustion_cooldown_secs: u64,
    /// Base cooldown after a non-2xx status; grows with each attempt.
    pub http_cooldown_secs: u64,
    pub http_max_cooldown_secs: u64,
    pub http_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connectivity_cooldown_secs: 10,
            connectivity_max_attempts: None,
            exhaustion_cooldown_secs: 10,
            http_cooldown_secs: 60,
            http_max_cooldown_secs: 600,
            http_max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DownloadConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub network_cooldown_secs: u64,
    pub status_cooldown_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_attempts: 10,
            network_cooldown_secs: 60,
            status_cooldown_secs: 15,
        }
    }
}

/// Extra fields to treat as volatile on top of the built-in counters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchemaConfig {
    pub extra_volatile_posts: Vec<String>,
    pub extra_volatile_users: Vec<String>,
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.pacing.profile, "classic");
        assert_eq!(config.retry.http_max_attempts, 10);
        assert_eq!(config.download.concurrency, 10);
        assert!(config.retry.connectivity_max_attempts.is_none());
    }

    #[test]
    fn partial_sections_override() {
        let config: FileConfig = toml::from_str(
            r#"
            [pacing]
            profile = "smoothed"
            jitter = [0.9, 1.1]

            [schema]
            extra_volatile_posts = ["recommend_count"]
            "#,
        )
        .unwrap();
        assert_eq!(config.pacing.profile, "smoothed");
        assert_eq!(config.pacing.jitter, Some([0.9, 1.1]));
        assert_eq!(config.schema.extra_volatile_posts, vec!["recommend_count"]);
        assert_eq!(config.retry.http_cooldown_secs, 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<FileConfig, _> = toml::from_str("[pacing]\nspeed = 3\n");
        assert!(result.is_err());
    }
}
