//! bidwatch CLI
//!
//! One-shot monitoring runs, intended for cron or CI scheduling.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use bidwatch::config;
use bidwatch::models::Config;
use bidwatch::pipeline::Monitor;
use bidwatch::services::ResponseCache;
use bidwatch::state::StateStore;

/// bidwatch - opportunity listing monitor
#[derive(Parser, Debug)]
#[command(name = "bidwatch", version, about = "Opportunity listing monitor")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "bidwatch.toml")]
    config: PathBuf,

    /// Path to the JSON state file
    #[arg(short, long, default_value = "state.json")]
    state: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one monitoring run
    Run {
        /// Detect and log changes without sending notifications or saving state
        #[arg(long)]
        dry_run: bool,

        /// Override the configured posted-date lookback window
        #[arg(long)]
        lookback_days: Option<i64>,

        /// Wall-clock budget for the whole run, in seconds
        #[arg(long, default_value_t = 600)]
        budget_secs: u64,

        /// Print the run report as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,

    /// Show tracked-state statistics
    Info,

    /// Run a maintenance task against local state and cache
    Maintenance {
        #[command(subcommand)]
        task: MaintenanceTask,
    },
}

#[derive(Subcommand, Debug)]
enum MaintenanceTask {
    /// Prune tracked entries unseen past the cutoff
    CleanupState {
        /// Age in days beyond which tracked entries are removed
        #[arg(long, default_value_t = 90)]
        age_days: i64,
    },

    /// Remove expired cache entries, or everything with --all
    PurgeCache {
        #[arg(long)]
        all: bool,
    },

    /// Print a state and cache report as JSON on stdout
    Report,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> bidwatch::error::Result<()> {
    match cli.command {
        Command::Run {
            dry_run,
            lookback_days,
            budget_secs,
            json,
        } => {
            let config = config::load_validated(&cli.config)?;
            let api_key = config::api_key_from_env()?;

            let monitor = Monitor::new(
                config,
                &api_key,
                &cli.state,
                dry_run,
                cli.verbose,
                lookback_days,
            )?;
            let report = monitor.run(Duration::from_secs(budget_secs)).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }

        Command::Validate => {
            let config = config::load_validated(&cli.config)?;
            log::info!(
                "Config OK: {} queries ({} enabled)",
                config.queries.len(),
                config.enabled_queries().len()
            );
        }

        Command::Info => {
            if !cli.state.exists() {
                log::info!("No state file at {}", cli.state.display());
                return Ok(());
            }

            let store = StateStore::load(&cli.state);
            let stats = store.stats();
            log::info!("State file: {}", cli.state.display());
            log::info!(
                "Tracked: {} total ({} last week, {} last month)",
                stats.total_tracked,
                stats.tracked_last_week,
                stats.tracked_last_month
            );
            match stats.last_run {
                Some(t) => log::info!("Last run: {}", t.to_rfc3339()),
                None => log::info!("Last run: never"),
            }
            if stats.total_queries > 0 {
                log::info!(
                    "Queries: {} tracked, {:.1}% success rate",
                    stats.total_queries,
                    stats.query_success_rate * 100.0
                );
            }
        }

        Command::Maintenance { task } => {
            maintenance(&cli.config, &cli.state, task)?;
        }
    }

    Ok(())
}

fn maintenance(
    config_path: &Path,
    state_path: &Path,
    task: MaintenanceTask,
) -> bidwatch::error::Result<()> {
    match task {
        MaintenanceTask::CleanupState { age_days } => {
            let store = StateStore::load(state_path);
            let before = store.len();
            let pruned = store.prune(chrono::Duration::days(age_days));
            store.save()?;
            log::info!(
                "State cleanup: {} pruned, {} kept (cutoff {} days)",
                pruned,
                before - pruned,
                age_days
            );
        }

        MaintenanceTask::PurgeCache { all } => {
            let config = Config::load_or_default(config_path);
            let cache = open_cache(&config)?;
            let removed = if all {
                cache.clear()
            } else {
                cache.purge_expired()
            };
            log::info!("Cache purge: removed {} entries", removed);
        }

        MaintenanceTask::Report => {
            let config = Config::load_or_default(config_path);
            let cache = open_cache(&config)?;
            let report = serde_json::json!({
                "generated_at": chrono::Utc::now(),
                "state": StateStore::load(state_path).stats(),
                "cache": cache.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn open_cache(config: &Config) -> bidwatch::error::Result<ResponseCache> {
    ResponseCache::open(
        &config.cache.dir,
        chrono::Duration::minutes(config.cache.ttl_minutes.max(1)),
        config.cache.max_entries.max(1),
    )
}
