//! Memory store CLI.
//!
//! Drives a [`MemoryManager`] against a store directory: add, retrieve,
//! consolidate, stats, and per-entry history.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use mnemon::{MemoryConfig, MemoryManager};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store directory (overrides MNEMON_STORE_PATH)
    #[arg(short, long, env = "MNEMON_STORE_PATH")]
    store: Option<PathBuf>,

    /// Disable the primary embedding model (deterministic fallback only)
    #[arg(long)]
    no_model: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a new memory
    Add {
        /// Memory content
        content: String,
        /// Importance score in 0.0..=10.0
        #[arg(long, default_value_t = 1.0)]
        importance: f64,
        /// Tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Provenance label
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// Retrieve memories relevant to a query
    Retrieve {
        /// Query text
        query: String,
        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        /// Minimum importance of returned entries
        #[arg(long, default_value_t = 0.0)]
        min_importance: f64,
    },
    /// Run one decay + consolidation cycle now
    Consolidate,
    /// Print aggregate statistics
    Stats,
    /// Print the full version history of one entry
    History {
        /// Entry id
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (M-LOG-STRUCTURED)
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();

    let mut config = MemoryConfig::load_from_env()
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if cli.no_model {
        config.model_enabled = false;
    }

    let manager = MemoryManager::open(config)
        .await
        .context("failed to open memory store")?;

    match cli.command {
        Command::Add {
            content,
            importance,
            tags,
            source,
        } => {
            let entry = manager.add(&content, importance, tags, &source).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Retrieve {
            query,
            top_k,
            min_importance,
        } => {
            let results = manager.retrieve(&query, top_k, min_importance).await?;
            for result in results {
                println!(
                    "{:.4}  {}  {}",
                    result.similarity,
                    result.entry.id,
                    preview(&result.entry.content)
                );
            }
        }
        Command::Consolidate => {
            let summary = manager.consolidate().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Stats => {
            let stats = manager.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::History { id } => {
            for record in manager.history(id).await? {
                println!(
                    "v{:06}  {}  {:?}  {}",
                    record.entry.version,
                    record.committed_at.to_rfc3339(),
                    record.status,
                    record.op
                );
            }
        }
    }

    Ok(())
}

/// First line of content, truncated for terminal output.
fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    let mut preview: String = line.chars().take(80).collect();
    if preview.len() < line.len() {
        preview.push('…');
    }
    preview
}
