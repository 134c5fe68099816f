use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use nyx_core::config::Config;
use nyx_core::modules::notes::NotesModule;
use nyx_core::modules::Event;
use nyx_core::outbound::LogConnector;
use nyx_core::runtime::Bot;

/// Nyx bot core - console front end for the persistence and rate-limit layer
#[derive(Parser, Debug)]
#[command(name = "nyx", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the document storage root
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Actor ids allowed to run admin commands
    #[arg(long, value_delimiter = ',')]
    admins: Vec<String>,
}

/// Parse a console line of the form `actor: message`.
fn parse_line(line: &str, admins: &[String]) -> Option<Event> {
    let (actor, content) = line.split_once(':')?;
    let actor = actor.trim();
    if actor.is_empty() {
        return None;
    }
    let mut event = Event::new(actor, "console", content.trim());
    event.is_admin = admins.iter().any(|a| a == actor);
    Some(event)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(root) = args.storage {
        config.storage.root = root;
    }

    info!(root = %config.storage.root.display(), "🌙 Nyx starting");

    let bot = Arc::new(Bot::new(&config, Arc::new(LogConnector)).await?);
    bot.register(Arc::new(NotesModule::new())).await?;

    let (tx, rx) = mpsc::channel(256);
    let admins = args.admins;
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line, &admins) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => warn!("expected `actor: message`"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    });

    {
        let bot = bot.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("⏹️ shutdown requested");
                bot.shutdown();
            }
        });
    }

    bot.run(rx).await;
    info!("👋 shut down");
    Ok(())
}
