//! drover CLI - distributed integration-test orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use drover::config::{self, Config};
use drover::orchestrator::Orchestrator;
use drover::report::ConsoleReporter;
use drover::transport::{ConnectionCache, ssh::SshConnector};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Distributed integration-test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "drover.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured tests against the DUT
    Run {
        /// Override the test-name patterns from the config file
        #[arg(short, long)]
        pattern: Vec<String>,

        /// Override the result directory
        #[arg(long)]
        result_dir: Option<PathBuf>,
    },

    /// List the tests the current config would run, without running them
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            pattern,
            result_dir,
        } => run_tests(&cli.config, pattern, result_dir, cli.verbose).await,
        Commands::List { format } => list_tests(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

fn build_orchestrator(config: Config, verbose: bool) -> Orchestrator {
    let targets = config.target.ssh_targets(config.run.proxy);
    let cache = Arc::new(ConnectionCache::new(Arc::new(SshConnector), targets));
    Orchestrator::new(config, cache, Arc::new(ConsoleReporter::new(verbose)))
}

async fn run_tests(
    config_path: &Path,
    pattern_override: Vec<String>,
    result_dir_override: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = load(config_path)?;
    if !pattern_override.is_empty() {
        config.run.patterns = pattern_override;
    }
    if let Some(result_dir) = result_dir_override {
        config.report.result_dir = result_dir;
    }
    info!(
        "driving {} with {} pattern(s)",
        config.target.host,
        config.run.patterns.len()
    );

    // Ctrl-C turns into cooperative cancellation; the run shuts its
    // children down and still emits results for what already finished.
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            ctrl_c_cancel.cancel();
        }
    });

    let orchestrator = build_orchestrator(config, verbose);
    let outcome = orchestrator.run(&cancel).await?;
    std::process::exit(outcome.summary.exit_code(outcome.failure.as_ref()));
}

async fn list_tests(config_path: &Path, format: &str) -> Result<()> {
    let config = load(config_path)?;
    let orchestrator = build_orchestrator(config, false);
    let resolved = orchestrator.list_tests().await?;

    match format {
        "json" => {
            let entities: Vec<_> = resolved.iter().map(|r| &r.entity).collect();
            println!("{}", serde_json::to_string_pretty(&entities)?);
        }
        _ => {
            for entity in &resolved {
                match &entity.skip_reason {
                    Some(reason) => {
                        println!("{} (skipped: {reason})", entity.entity.name)
                    }
                    None => println!("{}", entity.entity.name),
                }
            }
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    println!("Configuration OK");
    println!("  Target:  {}", config.target.host);
    println!("  Shards:  {}/{}", config.run.shard_index, config.run.total_shards);
    println!("  Results: {}", config.report.result_dir.display());
    Ok(())
}
