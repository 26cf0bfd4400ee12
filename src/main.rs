use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use grove::cli;
use grove::config::GroveConfig;

#[derive(Parser)]
#[command(
    name = "grove",
    version,
    about = "Local-first knowledge graph with hybrid keyword+vector retrieval"
)]
struct Cli {
    /// Project root (defaults to searching upward for grove.toml).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create grove.toml and the data directories.
    Init {
        /// Project name (defaults to the directory name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Add a bullet to a node (created on first add). Prints the bullet ID.
    Add {
        slug: String,
        text: String,
        /// fact, gotcha, decision, task, note, success, failure
        #[arg(long, default_value = "fact")]
        kind: String,
    },
    /// Replace a bullet's text (appends an update record).
    Update { bullet_id: String, text: String },
    /// Delete a bullet (appends a tombstone record).
    Delete { bullet_id: String },
    /// Show a node's live bullets.
    Show { slug: String },
    /// Keyword search over bullets.
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Hybrid search → ranked context block.
    Context {
        query: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 4000)]
        max_chars: usize,
    },
    /// Rebuild the derived store from records (and sync file sources).
    Reindex,
    /// Recompute score-quantile breakpoints.
    Calibrate,
    /// List nodes needing review.
    Review {
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark a node reviewed, clearing its served budget.
    MarkReviewed { slug: String },
    /// Show index, calibration, and watcher state.
    Status,
    /// Run the watcher (the single index writer). Foreground.
    Watch,
    /// Run the vector server. Foreground.
    VectorServer,
    /// Run the MCP server on stdio.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("grove: {err:#}");
        std::process::exit(grove::error::exit_code_for(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Init has no config to load yet.
    if let Command::Init { name } = &cli.command {
        let root = cli
            .root
            .clone()
            .unwrap_or(std::env::current_dir()?);
        init_tracing("info");
        return cli::init(&root, name.as_deref());
    }

    let config = GroveConfig::load(cli.root.as_deref())?;
    init_tracing(&config.server.log_level);

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::Add { slug, text, kind } => cli::add(&config, &slug, &text, &kind),
        Command::Update { bullet_id, text } => cli::update(&config, &bullet_id, &text),
        Command::Delete { bullet_id } => cli::delete(&config, &bullet_id),
        Command::Show { slug } => cli::show(&config, &slug),
        Command::Search { query, limit } => cli::search(&config, &query, limit),
        Command::Context {
            query,
            session,
            max_chars,
        } => cli::context(&config, &query, session, max_chars).await,
        Command::Reindex => cli::reindex(&config),
        Command::Calibrate => {
            // Calibration probes the vector server with blocking HTTP.
            tokio::task::spawn_blocking(move || cli::run_calibrate(&config)).await?
        }
        Command::Review { threshold, limit } => cli::review(&config, threshold, limit),
        Command::MarkReviewed { slug } => cli::mark_reviewed(&config, &slug),
        Command::Status => cli::status(&config),
        Command::Watch => grove::watcher::run(config).await,
        Command::VectorServer => grove::vector::server::run(config).await,
        Command::Serve => grove::server::serve_stdio(config).await,
    }
}

/// Log to stderr so stdout stays clean for MCP JSON-RPC and tool output.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
