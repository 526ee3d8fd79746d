//! The HTTP front end process. Opens the same on-disk store the `verved`
//! daemon points at and serves the long-poll/callback endpoints over axum.
//! Runs no reconciliation loops of its own — those are `verved`'s job, on
//! the same store file.

use std::sync::Arc;
use std::time::Duration;

use verve_core::config::{load_config, Config};
use verve_core::log_warn;
use verve_notify::Hub;
use verved::{Dispatch, EpicStore, SqliteStore, TaskStore};

const LOG_TAG: &str = "verve-web";

fn load_config_or_defaults(path: &std::path::Path) -> Config {
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            log_warn!(LOG_TAG, "failed to load config from {}: {err}, using defaults", path.display());
            Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("verve.toml"));
    let config = load_config_or_defaults(&config_path);

    let store = if config.store.dsn.is_empty() {
        log_warn!(LOG_TAG, "no store.dsn configured, using a non-persistent in-memory store");
        SqliteStore::open_in_memory()
    } else {
        SqliteStore::open(&config.store.dsn)
    }
    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

    let store = Arc::new(std::sync::Mutex::new(store));
    let hub = Hub::new();
    let tasks = Arc::new(TaskStore::new(store.clone(), hub.clone()));
    let epics = Arc::new(EpicStore::new(store, hub.clone()));
    epics.set_task_creator(tasks.clone());
    epics.set_task_status_reader(tasks.clone());
    let dispatch = Arc::new(Dispatch::new(epics.clone(), tasks.clone(), hub.clone()));

    let state = verve_web::AppState::new(
        tasks,
        epics,
        dispatch,
        hub,
        Duration::from_secs(config.timing.poll_deadline_secs),
        config.defaults,
    );

    verve_web::run_web_server(&config.server.bind_addr, state).await
}
