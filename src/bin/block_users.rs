use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use std::io::Read;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wiki_upload::infrastructure::database;
use wiki_upload::services::blocks::{BlockService, parse_user_list};

/// Blocks every user listed in FILE (or on stdin), one name per line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// User the blocks are made by; must hold the `block` right
    #[arg(long)]
    performer: String,

    /// Reason recorded with each block
    #[arg(long, default_value = "")]
    reason: String,

    /// File with one user name per line (defaults to stdin)
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "block_users=info,wiki_upload=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🔒 Starting bulk block tool...");

    // 1. Read the user list
    let text = match &args.file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Unable to read file {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Unable to read stdin")?;
            buf
        }
    };
    let usernames = parse_user_list(&text);

    // 2. Setup Infrastructure
    info!("🔌 Connecting to database...");
    let db = database::setup_database().await?;
    let service = BlockService::new(db);

    // 3. Resolve the performer
    let performer = match service.performer(&args.performer).await {
        Ok(performer) => performer,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    // 4. Block
    let outcomes = service
        .block_users(&performer, &usernames, &args.reason)
        .await?;
    for outcome in &outcomes {
        println!("{}", outcome);
    }

    info!("✅ Processed {} user(s).", outcomes.len());
    Ok(())
}
