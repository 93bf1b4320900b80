//! Ethereum Transfer Graph Grower CLI
//!
//! Grows a transfer graph from seed addresses against the Flipside ledger
//! (or an offline JSON fixture), checkpointing after every step.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use eth_graph_grower::checkpoint::Checkpoint;
use eth_graph_grower::config::GrowerConfig;
use eth_graph_grower::ethereum::{extract_addresses, Address};
use eth_graph_grower::grow::{FrontierEngine, StepReport};
use eth_graph_grower::ledger::{LedgerClient, MemoryLedger};
use eth_graph_grower::queries::{
    build_contract_query, build_label_query, build_transfer_query, RankBy,
};
use eth_graph_grower::render::render;
use eth_graph_grower::rpc::FlipsideClient;
use eth_graph_grower::schemas::GrowState;

#[derive(Parser)]
#[command(name = "eth-graph-grower")]
#[command(version)]
#[command(about = "Grow Ethereum transfer graphs from seed addresses", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Checkpoint directory (overrides paths.state_dir)
    #[arg(short, long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grow the graph from seeds, resuming from the checkpoint if present
    Grow(GrowArgs),

    /// Render the checkpointed graph to HTML
    Render {
        /// Output name, `.html` is appended (relative to paths.graphs_dir)
        #[arg(short, long, default_value = "graph")]
        output: String,
    },

    /// Print the SQL a growth step would send for these addresses
    Query {
        #[arg(value_enum)]
        kind: QueryKindArg,

        /// Addresses (any text containing 0x addresses)
        addresses: Vec<String>,

        #[arg(short, long, default_value = "500")]
        limit: usize,

        #[arg(long, default_value = "amount_usd")]
        rank_by: RankBy,
    },

    /// Show checkpoint status
    Status,
}

#[derive(Args)]
struct GrowArgs {
    /// Seed addresses (any text containing 0x addresses)
    seeds: Vec<String>,

    /// File with seed addresses
    #[arg(long)]
    seed_file: Option<PathBuf>,

    /// Addresses that must never be grown through
    #[arg(long)]
    nogrow: Vec<String>,

    /// File with addresses that must never be grown through
    #[arg(long)]
    nogrow_file: Option<PathBuf>,

    /// Maximum growth steps this run (defaults to max_steps from config)
    #[arg(short = 'n', long)]
    steps: Option<u32>,

    /// Keep transfers of tokens without a symbol
    #[arg(long)]
    keep_spam: bool,

    /// Extra token symbols to drop as spam
    #[arg(long = "spam-symbol")]
    spam_symbols: Vec<String>,

    /// Row cap per transfer query
    #[arg(short = 'k', long)]
    connection_limit: Option<usize>,

    /// Column ranking transfers under the row cap
    #[arg(long)]
    rank_by: Option<RankBy>,

    /// Keep growing through addresses with real labels
    #[arg(long)]
    through_labels: bool,

    /// Answer queries from a JSON fixture instead of Flipside
    #[arg(long)]
    offline: Option<PathBuf>,

    /// Ignore an existing checkpoint and start from the seeds
    #[arg(long)]
    fresh: bool,

    /// Render the result as `<name>.html` once growth stops
    #[arg(long)]
    render: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum QueryKindArg {
    Transfers,
    Labels,
    Contracts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => GrowerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => GrowerConfig::load().context("Failed to load config from environment")?,
    };

    if let Some(dir) = &cli.state_dir {
        config.paths.state_dir = dir.clone();
    }

    match cli.command {
        Commands::Grow(args) => {
            config.ensure_directories()?;
            cmd_grow(config, args).await?;
        }
        Commands::Render { output } => {
            config.ensure_directories()?;
            cmd_render(&config, &output)?;
        }
        Commands::Query {
            kind,
            addresses,
            limit,
            rank_by,
        } => {
            cmd_query(kind, &addresses, limit, rank_by)?;
        }
        Commands::Status => {
            cmd_status(&config)?;
        }
    }

    Ok(())
}

/// Collect addresses from CLI values and an optional file
fn collect_addresses(values: &[String], file: Option<&Path>) -> Result<Vec<Address>> {
    let mut addresses = Vec::new();
    for value in values {
        let found = extract_addresses(value);
        if found.is_empty() {
            warn!("No address found in {:?}, ignoring", value);
        }
        addresses.extend(found);
    }
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read address file {:?}", path))?;
        addresses.extend(extract_addresses(&contents));
    }
    Ok(addresses)
}

async fn cmd_grow(mut config: GrowerConfig, args: GrowArgs) -> Result<()> {
    info!("=== Growing Transfer Graph ===");

    if args.keep_spam {
        config.grow.drop_spam = false;
    }
    config.grow.spam_symbols.extend(args.spam_symbols.iter().cloned());
    if let Some(limit) = args.connection_limit {
        config.grow.connection_limit = limit;
    }
    if let Some(rank_by) = args.rank_by {
        config.grow.rank_by = rank_by;
    }
    if args.through_labels {
        config.grow.stop_at_label = false;
    }
    config.validate(args.offline.is_none())?;

    let seeds = collect_addresses(&args.seeds, args.seed_file.as_deref())?;
    let nogrow = collect_addresses(&args.nogrow, args.nogrow_file.as_deref())?;

    let checkpoint = Checkpoint::new(&config.paths.state_dir);
    let state = if checkpoint.exists() && !args.fresh {
        let mut state = checkpoint
            .load()
            .context("Failed to load checkpoint, rerun with --fresh to start over")?;
        if !seeds.is_empty() {
            info!("Adding {} seeds to the resumed frontier", seeds.len());
        }
        state.frontier.extend(seeds);
        state.exclusions.extend(nogrow);
        state
    } else {
        if seeds.is_empty() {
            anyhow::bail!("No seed addresses given and no checkpoint in {:?}", checkpoint.dir());
        }
        GrowState::seeded(seeds, nogrow)
    };

    info!(
        "Starting at step {} with {} frontier addresses, {} excluded",
        state.step,
        state.frontier.len(),
        state.exclusions.len()
    );

    let ledger: Box<dyn LedgerClient> = match &args.offline {
        Some(path) => {
            info!("Using offline ledger fixture {:?}", path);
            Box::new(
                MemoryLedger::from_json_file(path)
                    .with_context(|| format!("Failed to load ledger fixture {:?}", path))?,
            )
        }
        None => Box::new(
            FlipsideClient::new(config.ledger.clone(), config.rate_limits.clone())
                .context("Failed to create Flipside client")?,
        ),
    };
    let engine = FrontierEngine::new(ledger);

    let max_steps = args.steps.unwrap_or(config.max_steps);
    let final_state = engine
        .grow_until_converged(
            state,
            &config.grow,
            max_steps,
            |state: &GrowState, report: &StepReport| -> Result<()> {
                log_report(report);
                checkpoint
                    .save(state)
                    .with_context(|| format!("Failed to checkpoint step {}", state.step))?;
                Ok(())
            },
        )
        .await?;

    // A resumed state that was already converged never reaches on_step
    checkpoint.save(&final_state).context("Failed to save final state")?;

    info!("=== Growth Summary ===");
    info!("Steps: {}", final_state.step);
    info!("Converged: {}", final_state.is_converged());
    info!("Transfers: {}", final_state.dataset.len());
    info!("Labelled addresses: {}", final_state.labels.len());
    info!("Distinct labels: {}", final_state.reverse_labels.len());
    info!("Contracts: {}", final_state.contracts.len());

    if let Some(name) = &args.render {
        let path = render(
            &final_state.dataset,
            &final_state.labels,
            &final_state.reverse_labels,
            &final_state.contracts,
            &config.paths.graphs_dir.join(name),
        )
        .context("Failed to render graph")?;
        info!("Graph written to {:?}", path);
    }

    Ok(())
}

fn log_report(report: &StepReport) {
    if report.short_circuited() {
        return;
    }
    info!(
        "  queried {}, {} rows, {} kept, {} malformed, {} spam, {} zero-decimal, {} duplicates",
        report.queried,
        report.transfer_rows,
        report.kept,
        report.malformed,
        report.null_symbol + report.denylisted,
        report.zero_decimals,
        report.duplicates_removed
    );
}

fn cmd_render(config: &GrowerConfig, output: &str) -> Result<()> {
    info!("=== Rendering Graph ===");

    let checkpoint = Checkpoint::new(&config.paths.state_dir);
    let state = checkpoint.load().context("Failed to load checkpoint")?;
    if state.dataset.is_empty() {
        warn!("Checkpoint has no transfers, the graph will be empty");
    }

    let path = render(
        &state.dataset,
        &state.labels,
        &state.reverse_labels,
        &state.contracts,
        &config.paths.graphs_dir.join(output),
    )
    .context("Failed to render graph")?;

    info!("Graph written to {:?}", path);
    Ok(())
}

fn cmd_query(kind: QueryKindArg, values: &[String], limit: usize, rank_by: RankBy) -> Result<()> {
    let addresses = collect_addresses(values, None)?;
    if addresses.is_empty() {
        anyhow::bail!("No addresses given");
    }

    let query = match kind {
        QueryKindArg::Transfers => build_transfer_query(&addresses, limit, rank_by),
        QueryKindArg::Labels => build_label_query(&addresses),
        QueryKindArg::Contracts => build_contract_query(&addresses),
    };
    println!("{}", query.sql);
    Ok(())
}

fn cmd_status(config: &GrowerConfig) -> Result<()> {
    info!("=== Grower Status ===");
    info!("State directory: {:?}", config.paths.state_dir);

    let checkpoint = Checkpoint::new(&config.paths.state_dir);
    let files = [
        ("State", checkpoint.state_path()),
        ("Transfers", checkpoint.transfers_path()),
        ("Metadata", checkpoint.metadata_path()),
    ];

    for (name, path) in &files {
        if path.exists() {
            let size_kb = std::fs::metadata(path)?.len() / 1024;
            info!("  {} {}: {:?} ({} KB)", "✓", name, path, size_kb);
        } else {
            info!("  {} {}: not found", "✗", name);
        }
    }

    match checkpoint.load_metadata() {
        Ok(metadata) => {
            let counts = &metadata.record_counts;
            info!("Last saved: {}", metadata.run_timestamp);
            info!("Steps: {} (converged: {})", metadata.steps, metadata.converged);
            info!("Transfers: {}", counts.transfers);
            info!(
                "Labelled addresses: {} ({} distinct labels)",
                counts.labeled_addresses, counts.distinct_labels
            );
            info!("Contracts: {}", counts.contracts);
            info!("Excluded: {}", counts.exclusions);
            info!("Frontier: {}", counts.frontier);
            if let Some(commit) = &metadata.git_commit {
                info!("Git commit: {}", commit);
            }
        }
        Err(e) => {
            info!("No run metadata: {}", e);
        }
    }

    Ok(())
}
