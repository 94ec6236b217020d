mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tansaek::config::EngineConfig;

#[derive(Parser)]
#[command(
    name = "tansaek",
    version,
    about = "Adaptive parallel fetch-and-converge engine for iterative web research",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (TANSAEK_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Print Prometheus metrics after the command finishes
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch URLs once and print the results as JSON
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Run a multi-round research session from seed URLs
    Research {
        /// Seed URL (repeatable)
        #[arg(short, long = "seed", required = true)]
        seeds: Vec<String>,

        /// Session name used for checkpoints
        #[arg(long)]
        session: Option<String>,

        /// Maximum URLs fetched per round
        #[arg(long, default_value = "20")]
        max_urls_per_round: usize,

        /// Follow links to other domains too
        #[arg(long, default_value = "false")]
        all_domains: bool,
    },

    /// Resume a research session from its checkpoint
    Resume {
        /// Session name
        #[arg(long)]
        session: String,

        /// Maximum URLs fetched per round
        #[arg(long, default_value = "20")]
        max_urls_per_round: usize,

        /// Follow links to other domains too
        #[arg(long, default_value = "false")]
        all_domains: bool,
    },

    /// Show saved research sessions
    Stats {
        /// Only this session
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(log_format, &config.logging.level, cli.verbose)?;

    if cli.metrics {
        if let Err(e) = tansaek::metrics::init_metrics() {
            tracing::warn!(error = %e, "Metrics initialization failed");
        }
    }

    tracing::info!("tansaek starting");

    match cli.command {
        Commands::Fetch { urls } => {
            tracing::info!(count = urls.len(), "Starting fetch command");
            commands::fetch(&config, urls).await?;
        }

        Commands::Research {
            seeds,
            session,
            max_urls_per_round,
            all_domains,
        } => {
            tracing::info!(
                seeds = seeds.len(),
                session = ?session,
                max_urls_per_round,
                all_domains,
                "Starting research command"
            );
            commands::research(
                &config,
                commands::ResearchParams {
                    seeds,
                    session,
                    max_urls_per_round,
                    all_domains,
                },
            )
            .await?;
        }

        Commands::Resume {
            session,
            max_urls_per_round,
            all_domains,
        } => {
            tracing::info!(session = %session, "Starting resume command");
            commands::resume(&config, session, max_urls_per_round, all_domains).await?;
        }

        Commands::Stats { session } => {
            commands::stats(&config, session)?;
        }
    }

    if cli.metrics {
        match tansaek::metrics::gather_metrics() {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
        }
    }

    tracing::info!("tansaek completed successfully");
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("tansaek=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("tansaek={level},warn"))?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
