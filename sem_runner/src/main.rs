//! SEM command-line front-end
//!
//! Runs parameter sweeps into a campaign, lists stored results and merges
//! campaigns.

use clap::{Parser, Subcommand};
use sem_core::{merge_campaigns, CampaignStore, ParamSpec, ParamValue, ResultQuery, SemError, SemResult};
use sem_env::{BuildProfile, ProcessSimulator};
use sem_runner::{CampaignManager, RunOptions, RunnerConfig, RunnerKind, TracingObserver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Simulation Execution Manager
#[derive(Parser, Debug)]
#[command(name = "sem")]
#[command(about = "Run and organize simulation campaigns", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every missing combination of a parameter spec
    Run {
        /// Campaign directory (absolute)
        #[arg(long)]
        campaign: PathBuf,

        /// Simulator executable
        #[arg(long)]
        simulator: PathBuf,

        /// Script name recorded in the campaign
        #[arg(long)]
        script: String,

        /// JSON object of scalars and lists
        #[arg(long)]
        spec: PathBuf,

        /// Runs per combination
        #[arg(long)]
        runs: Option<usize>,

        /// sequential, parallel or lpt
        #[arg(long, default_value = "parallel")]
        runner: RunnerKind,

        /// JSON runner configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum concurrent simulations
        #[arg(short = 'j', long)]
        workers: Option<usize>,

        /// Replace an existing campaign at the same location
        #[arg(long)]
        overwrite: bool,

        /// Build identity to record instead of asking git
        #[arg(long)]
        commit: Option<String>,

        /// The executable is a debug build (enables logging)
        #[arg(long)]
        debug_build: bool,

        /// Directory added to the simulator's library path
        #[arg(long)]
        library_path: Option<PathBuf>,

        /// Log components to enable, as component=levels
        #[arg(long = "log")]
        log: Vec<String>,
    },

    /// List stored results, optionally filtered by parameter values
    View {
        #[arg(long)]
        campaign: PathBuf,

        /// Filter as key=value; repeat a key to allow several values
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// Merge campaigns with identical configurations
    Merge {
        #[arg(long)]
        output: PathBuf,

        /// Source campaign directories
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Move result data instead of copying it and remove the sources
        #[arg(long = "move")]
        move_data: bool,
    },
}

fn split_pair(text: &str) -> SemResult<(&str, &str)> {
    text.split_once('=')
        .ok_or_else(|| SemError::bad_spec(format!("expected key=value, got '{}'", text)))
}

async fn run_command(command: Command) -> SemResult<()> {
    match command {
        Command::Run {
            campaign,
            simulator,
            script,
            spec,
            runs,
            runner,
            config,
            workers,
            overwrite,
            commit,
            debug_build,
            library_path,
            log,
        } => {
            let mut sim = ProcessSimulator::new(simulator, script);
            if debug_build {
                sim = sim.with_profile(BuildProfile::Debug);
            }
            if let Some(commit) = commit {
                sim = sim.with_commit(commit);
            }
            if let Some(path) = library_path {
                sim = sim.with_library_path(path);
            }

            let mut config = match config {
                Some(path) => RunnerConfig::from_file(path)?,
                None => RunnerConfig::default(),
            };
            if let Some(workers) = workers {
                config = config.with_max_workers(workers);
            }

            let spec_json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&spec)?)?;
            let spec = ParamSpec::from_json(&spec_json)?;

            let observer = Arc::new(TracingObserver::new());
            let manager = CampaignManager::new(&campaign, sim.shared(), overwrite)
                .await?
                .with_runner(runner)
                .with_config(config)
                .with_observer(observer.clone());

            let mut options = RunOptions {
                runs,
                ..RunOptions::default()
            };
            if !log.is_empty() {
                let pairs = log.iter().map(|entry| split_pair(entry)).collect::<SemResult<Vec<_>>>()?;
                options = options.with_log_components(manager.log_components(pairs).await?);
            }

            let report = manager.run_missing_simulations(&spec, options).await?;
            info!(
                "Stored {} new results ({} failed), campaign now holds {}",
                report.results_inserted,
                observer.failed(),
                manager.store().len()
            );
            for path in &report.log_files {
                info!("  log: {}", path.display());
            }
        }

        Command::View { campaign, params } => {
            let store = CampaignStore::load(&campaign)?;
            let mut query = ResultQuery::new();
            for entry in &params {
                let (key, value) = split_pair(entry)?;
                query
                    .params
                    .entry(key.to_string())
                    .or_default()
                    .push(ParamValue::infer(value));
            }
            let results = store.get_results(&query)?;
            for result in &results {
                println!("{}", result);
            }
            info!("{} of {} results match", results.len(), store.len());
        }

        Command::Merge {
            output,
            sources,
            move_data,
        } => {
            let merged = merge_campaigns(&output, &sources, move_data)?;
            info!("Merged {} campaigns into {} ({} results)", sources.len(), output.display(), merged.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }

    if let Err(e) = run_command(args.command).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
