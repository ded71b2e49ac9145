use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aweme_common::{Config, UserRef};
use aweme_harvester::setup;

#[derive(Parser)]
#[command(name = "aweme", about = "Harvest posts and media from followed accounts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest the given users (uid, sec_uid or profile URL), or every due
    /// subscription when none are given.
    Harvest { users: Vec<UserRef> },
    /// Subscribe to every account the main session follows.
    SyncFollowing,
    /// Fetch, persist and download a single post.
    Post {
        id: u64,
        /// Fetch the detail page even if a finished copy is cached.
        #[arg(long)]
        refresh: bool,
    },
    /// Refresh one user's profile and print it.
    User { user: UserRef },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("aweme=info".parse()?);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let mut harvester = setup::build(&config).await?;

    match cli.command {
        Command::Harvest { users } => {
            let stats = harvester.harvest(&users).await?;
            info!("{stats}");
        }
        Command::SyncFollowing => {
            let added = harvester.sync_following().await?;
            info!(added, "Following sync complete");
        }
        Command::Post { id, refresh } => {
            let post = harvester.fetch_post(id, refresh).await?;
            println!("{}", serde_json::to_string_pretty(&post)?);
        }
        Command::User { user } => {
            let user = harvester.refresh_user(&user).await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
    }

    Ok(())
}
