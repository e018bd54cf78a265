//! # Transcript Retrieval CLI (`trx`)
//!
//! ## Usage
//!
//! ```bash
//! trx --config ./config/trx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trx init` | Create the SQLite database and run schema migrations |
//! | `trx ingest <file>` | Chunk a transcript and queue it for indexing |
//! | `trx index [--watch]` | Drain the indexing queue, or keep workers running |
//! | `trx watchdog [--once]` | Reclaim stale claims |
//! | `trx search "<query>" --transcript <id>` | Ranked chunks as JSON |
//! | `trx status` | Indexing status by `extraction_status` |
//! | `trx requeue` | Move failed work back to `pending` |
//! | `trx delete <id>` | Soft-delete a transcript |
//! | `trx serve` | Start the HTTP server |
//!
//! Logs go to stderr; set `RUST_LOG` to change the level
//! (default `transcript_retrieval=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use transcript_retrieval::core::retrieve::{EntityFilter, RetrievalWeights};
use transcript_retrieval::ingest::TranscriptInput;
use transcript_retrieval::search::SearchRequest;
use transcript_retrieval::{config, indexer, ingest, migrate, search, server, stats, watchdog};

/// Transcript Retrieval: chunk, index, and retrieve call-transcript passages.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trx",
    about = "Transcript Retrieval — chunking, indexing, and hybrid retrieval over call transcripts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a transcript text file.
    ///
    /// Chunks the text and queues the transcript for indexing. Re-ingesting
    /// identical text is a no-op.
    Ingest {
        /// Path to a UTF-8 text file, one speaker turn per line.
        file: PathBuf,

        /// Transcript id. A new UUID is assigned when omitted.
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        title: Option<String>,

        /// Owning rep.
        #[arg(long)]
        rep: Option<String>,

        /// Owning team.
        #[arg(long)]
        team: Option<String>,
    },

    /// Run the indexer.
    ///
    /// Without `--watch`, processes queued transcripts until the queue is
    /// empty and exits.
    Index {
        /// Keep `[indexing].workers` workers polling until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },

    /// Reclaim claims stuck in `processing` past `[watchdog].stale_after_secs`.
    Watchdog {
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },

    /// Retrieve ranked chunks. Prints JSON.
    Search {
        /// Free-text query.
        query: String,

        /// Transcript ids to search within. Required.
        #[arg(long = "transcript", required = true)]
        transcripts: Vec<String>,

        /// Only chunks tagged with one of these topics.
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// Only chunks tagged with one of these qualification tags.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Requested entity as `type:value`, e.g. `competitor:Gong`.
        #[arg(long = "entity", value_parser = parse_entity)]
        entities: Vec<EntityFilter>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        weight_vector: Option<f64>,

        #[arg(long)]
        weight_fts: Option<f64>,

        #[arg(long)]
        weight_entity: Option<f64>,
    },

    /// Show indexing status and failed chunks.
    Status {
        #[arg(long)]
        transcript: Option<String>,
    },

    /// Move failed chunks and transcript jobs back to `pending`.
    Requeue {
        #[arg(long)]
        transcript: Option<String>,
    },

    /// Soft-delete a transcript. It is excluded from retrieval.
    Delete {
        id: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn parse_entity(s: &str) -> Result<EntityFilter, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

/// A channel that flips to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("transcript_retrieval=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest {
            file,
            id,
            title,
            rep,
            team,
        } => {
            let input = TranscriptInput {
                id,
                title,
                rep_id: rep,
                team_id: team,
                ..TranscriptInput::default()
            };
            ingest::run_ingest(&cfg, &file, input).await?;
        }
        Commands::Index { watch } => {
            indexer::run_index(&cfg, watch, shutdown_on_ctrl_c()).await?;
        }
        Commands::Watchdog { once } => {
            watchdog::run_watchdog(&cfg, once, shutdown_on_ctrl_c()).await?;
        }
        Commands::Search {
            query,
            transcripts,
            topics,
            tags,
            entities,
            limit,
            weight_vector,
            weight_fts,
            weight_entity,
        } => {
            let weights = if weight_vector.is_some() || weight_fts.is_some() || weight_entity.is_some() {
                let base = cfg.retrieval.weights();
                Some(RetrievalWeights::new(
                    weight_vector.unwrap_or(base.weight_vector),
                    weight_fts.unwrap_or(base.weight_fts),
                    weight_entity.unwrap_or(base.weight_entity),
                ))
            } else {
                None
            };
            let request = SearchRequest {
                query,
                embedding: None,
                transcript_ids: transcripts,
                topics,
                qualification_tags: tags,
                entities,
                weights,
                match_count: limit,
            };
            search::run_search(&cfg, request).await?;
        }
        Commands::Status { transcript } => {
            stats::run_status(&cfg, transcript.as_deref()).await?;
        }
        Commands::Requeue { transcript } => {
            stats::run_requeue(&cfg, transcript.as_deref()).await?;
        }
        Commands::Delete { id } => {
            stats::run_delete(&cfg, &id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
