pub mod config;
pub mod file_config;
pub mod types;

pub use config::Config;
pub use file_config::{load_config, DownloadConfig, FileConfig, PacingConfig, RetryConfig, SchemaConfig};
pub use types::*;
