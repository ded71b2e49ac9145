use std::path::PathBuf;

use anyhow::Result;

/// Browser identity presented on every request. The signing helper must be
/// given the same string or the token will not validate.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Application configuration loaded from environment variables.
/// Contains only secrets and machine-specific paths; pacing, retry and
/// schema tunables live in the TOML FileConfig.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_url: Option<String>,

    // Sessions
    pub cookie_file: PathBuf,
    pub signer_command: Option<String>,
    pub user_agent: String,

    // Media
    pub download_dir: PathBuf,

    // Tunables
    pub config_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            cookie_file: std::env::var("AWEME_COOKIE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cookie.json")),
            signer_command: std::env::var("AWEME_SIGNER").ok().filter(|s| !s.is_empty()),
            user_agent: std::env::var("AWEME_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            download_dir: std::env::var("AWEME_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_download_dir()),
            config_file: std::env::var("AWEME_CONFIG").ok().map(PathBuf::from),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(12).collect();
            format!("{head}...({} chars)", val.chars().count())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview_opt(&self.database_url));
        tracing::info!("  AWEME_COOKIE_FILE: {}", self.cookie_file.display());
        tracing::info!("  AWEME_SIGNER: {}", preview_opt(&self.signer_command));
        tracing::info!("  AWEME_DOWNLOAD_DIR: {}", self.download_dir.display());
    }
}

fn default_download_dir() -> PathBuf {
    let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();
    home.join("Pictures").join("Aweme")
}
