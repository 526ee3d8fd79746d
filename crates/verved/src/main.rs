//! `verved`: the background daemon process. Wires the store, task/epic
//! stores and reconciler together and runs the periodic sweeps standalone,
//! without an HTTP front end — `verve-web` is the separate process that
//! serves the long-poll/callback endpoints against the same on-disk store.
//! Grounded on `orchd/src/main.rs`'s clap
//! `Parser`/`Subcommand` shape and its `signal_hook`-backed graceful
//! shutdown loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use verve_core::config::{load_config, Config};
use verve_core::{log_error, log_info, log_warn, AppError, Repo, RepoId};
use verve_forge::GhCliForgeClient;
use verve_notify::Hub;
use verved::{EpicStore, Reconciler, SqliteStore, TaskStore};

const LOG_TAG: &str = "verved";

#[derive(Parser)]
#[command(name = "verved", about = "Verve orchestration daemon")]
struct Cli {
    /// Path to the TOML config file. Missing file falls back to defaults.
    #[arg(long, default_value = "verve.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciler, staleness reaper and epic-completion sweeps
    /// until signalled.
    Serve {
        /// Run a single sweep of every loop and exit, instead of looping.
        #[arg(long)]
        once: bool,
    },
    /// Open the store and apply schema migrations, then exit.
    Migrate,
    /// Register a repository the orchestrator can dispatch work against.
    AddRepo {
        owner: String,
        name: String,
    },
    /// List registered repositories.
    ListRepos,
}

fn open_store(config: &Config) -> Result<SqliteStore, AppError> {
    if config.store.dsn.is_empty() {
        log_warn!(LOG_TAG, "no store.dsn configured, using a non-persistent in-memory store");
        SqliteStore::open_in_memory()
    } else {
        SqliteStore::open(&config.store.dsn)
    }
}

fn load_config_or_defaults(path: &std::path::Path) -> Config {
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            log_warn!(LOG_TAG, "failed to load config from {}: {err}, using defaults", path.display());
            Config::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config_or_defaults(&cli.config);

    match cli.command {
        Commands::Migrate => {
            open_store(&config)?;
            log_info!(LOG_TAG, "schema is up to date");
            Ok(())
        }
        Commands::AddRepo { owner, name } => {
            let store = open_store(&config)?;
            let full_name = format!("{owner}/{name}");
            let repo = Repo {
                id: RepoId::new(format!("{owner}-{name}")),
                owner,
                name,
                full_name,
                created_at: chrono::Utc::now(),
            };
            store.create_repo(&repo)?;
            println!("{}", repo.id);
            Ok(())
        }
        Commands::ListRepos => {
            let store = open_store(&config)?;
            for repo in store.list_repos()? {
                println!("{}\t{}", repo.id, repo.full_name);
            }
            Ok(())
        }
        Commands::Serve { once } => run_serve(config, once),
    }
}

fn run_serve(config: Config, once: bool) -> anyhow::Result<()> {
    let store = Arc::new(Mutex::new(open_store(&config)?));
    let hub = Hub::new();
    let tasks = Arc::new(TaskStore::new(store.clone(), hub.clone()));
    let epics = Arc::new(EpicStore::new(store, hub));
    epics.set_task_creator(tasks.clone());
    epics.set_task_status_reader(tasks.clone());
    let reconciler = Reconciler::new(tasks.clone(), Arc::new(GhCliForgeClient::default()));

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let stale_after = Duration::from_secs(config.timing.heartbeat_stale_secs);
        let tick_interval = Duration::from_secs(config.timing.reconciler_interval_secs);

        log_info!(
            LOG_TAG,
            "serving: reconciler every {}s, staleness threshold {}s",
            tick_interval.as_secs(),
            stale_after.as_secs()
        );

        loop {
            let merged = reconciler.run_once().await;
            if merged > 0 {
                log_info!(LOG_TAG, "reconciler transitioned {merged} task(s)");
            }

            let repo_ids: Vec<RepoId> = match tasks.list_repos() {
                Ok(repos) => repos.into_iter().map(|r| r.id).collect(),
                Err(err) => {
                    log_error!(LOG_TAG, "failed to list repos for staleness sweep: {err}");
                    Vec::new()
                }
            };
            match tasks.reap_stale(stale_after, &repo_ids) {
                Ok(n) if n > 0 => log_info!(LOG_TAG, "reaped {n} stale running task(s)"),
                Ok(_) => {}
                Err(err) => log_error!(LOG_TAG, "staleness reaper failed: {err}"),
            }

            match epics.release_stale_claims(stale_after) {
                Ok(n) if n > 0 => log_info!(LOG_TAG, "released {n} stale planning claim(s)"),
                Ok(_) => {}
                Err(err) => log_error!(LOG_TAG, "epic claim release failed: {err}"),
            }

            match epics.sweep_completion() {
                Ok(n) if n > 0 => log_info!(LOG_TAG, "completed {n} epic(s)"),
                Ok(_) => {}
                Err(err) => log_error!(LOG_TAG, "epic completion sweep failed: {err}"),
            }

            if once {
                log_info!(LOG_TAG, "--once: exiting after a single sweep");
                break;
            }
            if shutdown.load(Ordering::Relaxed) {
                log_info!(LOG_TAG, "received signal, shutting down");
                break;
            }

            tokio::time::sleep(tick_interval).await;

            if shutdown.load(Ordering::Relaxed) {
                log_info!(LOG_TAG, "received signal, shutting down");
                break;
            }
        }
    });

    Ok(())
}
