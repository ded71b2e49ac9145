//! Wires a production harvester from environment and file configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use aweme_archive::{migrate, HttpMediaFetcher, MediaDownloader};
use aweme_client::{
    load_cookies, Clock, CommandSigner, HttpSession, PacingGovernor, PacingProfile, RetryPolicy,
    RetryingTransport, Session, SystemClock,
};
use aweme_common::{load_config, Config, FileConfig, SessionId};
use tracing::{info, warn};

use crate::harvester::{Harvester, Sessions, Stores};

pub fn file_config(config: &Config) -> Result<FileConfig> {
    match &config.config_file {
        Some(path) => {
            let file = load_config(path)?;
            info!(path = %path.display(), "loaded tunables");
            Ok(file)
        }
        None => Ok(FileConfig::default()),
    }
}

/// One reqwest session per account, each with its own pacing state.
pub fn sessions(config: &Config, profile: &PacingProfile) -> Result<Sessions> {
    let mut cookies = load_cookies(&config.cookie_file)?;
    let mut open = |id: SessionId| -> Result<Session> {
        let jar = cookies.remove(&id).unwrap_or_default();
        if jar.is_empty() {
            warn!(session = %id, file = %config.cookie_file.display(), "no cookies, session is anonymous");
        }
        let http = HttpSession::new(&config.user_agent, &jar)
            .with_context(|| format!("{id} session"))?;
        Ok(Session::new(
            id,
            Arc::new(http),
            PacingGovernor::new(profile.clone()),
        ))
    };
    let main = open(SessionId::Main)?;
    let alt = open(SessionId::Alt)?;
    Ok(Sessions::new(main, alt))
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn stores(config: &Config) -> Result<Stores> {
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set, nothing will outlive this process");
        return Ok(Stores::memory());
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("Failed to connect to Postgres")?;
    migrate(&pool).await?;
    info!("Database migrations complete");
    Ok(Stores::postgres(pool))
}

pub async fn build(config: &Config) -> Result<Harvester> {
    let file = file_config(config)?;
    let profile = PacingProfile::from_config(&file.pacing)?;

    let command = config
        .signer_command
        .as_deref()
        .context("AWEME_SIGNER must be set")?;
    let signer = Arc::new(CommandSigner::new(command, config.user_agent.clone())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = RetryingTransport::new(signer, clock.clone(), RetryPolicy::from_config(&file.retry));

    let fetcher = Arc::new(HttpMediaFetcher::new(&config.user_agent)?);
    let downloader = MediaDownloader::from_config(fetcher, clock, &file.download);

    Ok(Harvester::new(
        transport,
        sessions(config, &profile)?,
        stores(config).await?,
        &file.schema,
        downloader,
        config.download_dir.clone(),
    ))
}
