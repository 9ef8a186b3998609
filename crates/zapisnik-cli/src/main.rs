//! Zapisnik CLI
//!
//! Usage:
//!   zapisnik run       - Start the Telegram frontend
//!   zapisnik memory    - Inspect or wipe stored user records

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zapisnik_store::{RecordStore, SqliteStore};

mod memory;
mod telegram;

#[derive(Parser)]
#[command(name = "zapisnik")]
#[command(version)]
#[command(about = "Conversational assistant with persistent per-user memory", long_about = None)]
struct Cli {
    /// Path to the sqlite store (defaults to ~/.zapisnik/store.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Telegram frontend (token from TELOXIDE_TOKEN)
    Run,

    /// Administer stored user records
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print one user's fields and memory entries
    List {
        /// External numeric user id
        user: i64,
    },

    /// Delete a memory entry, or the whole record with --all
    Forget {
        /// External numeric user id
        user: i64,

        /// Entry id to delete
        #[arg(long, conflicts_with = "all")]
        entry: Option<i64>,

        /// Wipe every field and entry for the user
        #[arg(long)]
        all: bool,
    },
}

fn open_store(db: Option<PathBuf>) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store = match db {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = open_store(cli.db)?;

    match cli.command {
        Commands::Run => telegram::run(store).await,
        Commands::Memory { action } => match action {
            MemoryAction::List { user } => memory::list(store.as_ref(), user.into()),
            MemoryAction::Forget { user, entry, all } => {
                memory::forget(store.as_ref(), user.into(), entry, all)
            }
        },
    }
}
