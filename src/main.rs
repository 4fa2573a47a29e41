// ABOUTME: CLI entry point for changeset-replicator
// ABOUTME: Parses commands, merges config, and routes to command handlers

use std::path::PathBuf;

use anyhow::Context;
use changeset_replicator::commands;
use changeset_replicator::config::Config;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "changeset-replicator")]
#[command(about = "Load OpenStreetMap changeset metadata into PostgreSQL and keep it current", long_about = None)]
#[command(version)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "CHANGESET_DATABASE_URL", global = true)]
    database: Option<String>,
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create changeset, comment, and state tables
    Create {
        /// Add a PostGIS bounding-box geometry column
        #[arg(long)]
        geometry: bool,
    },
    /// Empty the changeset tables and drop their indexes
    Truncate,
    /// Load a full changeset dump (.osm, .osm.gz, or .osm.bz2)
    Load {
        #[arg(long)]
        file: PathBuf,
        /// Only insert changesets newer than those already stored
        #[arg(long)]
        incremental: bool,
        /// Re-import changesets stored as still open
        #[arg(long, requires = "incremental")]
        delete_open: bool,
        /// Changesets per transaction
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Apply one local replication diff, replacing stored changesets
    Apply {
        #[arg(long)]
        file: PathBuf,
        /// Changesets per transaction
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Fetch and apply remote replication diffs until caught up
    Replicate {
        /// Replication server base URL
        #[arg(long)]
        base_url: Option<String>,
        /// Apply at most this many diffs in this run
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        max_sequences: Option<u64>,
        /// Changesets per transaction
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Seed the last applied replication sequence
    InitState {
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
        sequence: i64,
    },
    /// Show the replication state row
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear a stale update_in_progress flag left by a crashed run
    Unlock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    changeset_replicator::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = Config::load(cli.config.as_deref())?;
    let database_url = cli
        .database
        .or_else(|| config.database_url.clone())
        .context(
            "Database URL not provided. Use `--database`, set CHANGESET_DATABASE_URL, \
             or add database_url to the config file",
        )?;
    let batch_size = |flag: Option<usize>| flag.unwrap_or(config.batch_size).max(1);

    match cli.command {
        Commands::Create { geometry } => {
            commands::schema::create(&database_url, geometry || config.geometry).await
        }
        Commands::Truncate => commands::schema::truncate(&database_url).await,
        Commands::Load {
            file,
            incremental,
            delete_open,
            batch_size: size,
        } => {
            commands::load::run(commands::LoadOptions {
                database_url,
                file,
                incremental,
                delete_open,
                batch_size: batch_size(size),
            })
            .await
        }
        Commands::Apply {
            file,
            batch_size: size,
        } => {
            commands::load::apply(commands::ApplyOptions {
                database_url,
                file,
                batch_size: batch_size(size),
            })
            .await
        }
        Commands::Replicate {
            base_url,
            max_sequences,
            batch_size: size,
        } => {
            let mut settings = config.replication.clone();
            if let Some(base_url) = base_url {
                settings.base_url = base_url;
            }
            if max_sequences.is_some() {
                settings.max_sequences_per_run = max_sequences;
            }

            let outcome = commands::replicate::run(commands::ReplicateOptions {
                database_url,
                settings,
                batch_size: batch_size(size),
            })
            .await?;

            let code = outcome.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::InitState { sequence } => {
            commands::state::init_state(&database_url, config.replication.lock_key, sequence).await
        }
        Commands::Status { json } => {
            commands::state::status(&database_url, config.replication.lock_key, json).await
        }
        Commands::Unlock => {
            commands::state::unlock(&database_url, config.replication.lock_key).await
        }
    }
}
