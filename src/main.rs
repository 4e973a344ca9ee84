//! # Product Search CLI (`psearch`)
//!
//! ## Usage
//!
//! ```bash
//! psearch --config ./config/psearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `psearch init` | Create Postgres tables and the OpenSearch k-NN index |
//! | `psearch ingest <csv>` | Ingest a catalogue CSV (local path or `s3://bucket/key`) |
//! | `psearch embed <id@date>...` | Embed specific products |
//! | `psearch worker [--once]` | Consume the embedding queue |
//! | `psearch query "<text>"` | Print the most similar products |
//! | `psearch serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use product_search::config::{self, LogConfig, LogFormat};
use product_search::{ingest, migrate, pipeline, search, server, worker};

/// Product Search CLI: ingest a product catalogue, embed it and serve
/// similar-product search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/psearch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "psearch",
    about = "Product ingestion, embedding and similarity search",
    version,
    long_about = "Ingests a product catalogue into Postgres and SQS, embeds queued products \
    with a sentence-embedding model into pgvector and OpenSearch, and serves similar-product \
    search over a CLI and HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/psearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the Postgres schema and the OpenSearch index.
    ///
    /// Enables the pgvector extension and creates the raw and embedded
    /// product tables. Safe to run repeatedly.
    Init,

    /// Ingest a product catalogue CSV.
    ///
    /// Every row is upserted into Postgres and announced on the embedding
    /// queue. Exits non-zero if any product fails.
    Ingest {
        /// Local CSV path or `s3://bucket/key`.
        source: String,
    },

    /// Run the embedding pipeline for specific products.
    Embed {
        /// `<product_id>@<modified_date>`, e.g. `0000000001@2024-06-01 12:00:00`.
        #[arg(required = true)]
        products: Vec<String>,
    },

    /// Consume the embedding queue.
    ///
    /// Successful messages are deleted; failed ones stay on the queue and
    /// are redelivered after the visibility timeout.
    Worker {
        /// Process a single batch and exit (non-zero if any message failed).
        #[arg(long)]
        once: bool,
    },

    /// Search for products similar to a free-text query.
    Query {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity in [-1, 1].
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f64>,
    },

    /// Start the HTTP API.
    Serve,
}

fn init_tracing(log: &LogConfig) {
    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.log);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
        }
        Commands::Ingest { source } => {
            ingest::run_ingest(&cfg, &source).await?;
        }
        Commands::Embed { products } => {
            pipeline::run_embed(&cfg, &products).await?;
        }
        Commands::Worker { once } => {
            worker::run_worker(&cfg, once).await?;
        }
        Commands::Query {
            query,
            limit,
            threshold,
        } => {
            search::run_query(&cfg, &query, limit, threshold).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
