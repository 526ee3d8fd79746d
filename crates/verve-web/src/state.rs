use std::sync::Arc;
use std::time::Duration;

use verve_core::config::DefaultsConfig;
use verve_notify::Hub;
use verved::{Dispatch, EpicStore, TaskStore};

/// Shared handle cloned into every axum handler. Grounded on
/// `orch-web/src/state.rs`'s `WebState` shape (`Arc`-wrapped shared handles
/// cloned per request), generalized from one `RwLock<WebStateInner>` to the
/// already-`Arc`'d stores `verved` provides.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<TaskStore>,
    pub epics: Arc<EpicStore>,
    pub dispatch: Arc<Dispatch>,
    pub hub: Hub,
    pub default_poll_deadline: Duration,
    pub defaults: DefaultsConfig,
}

impl AppState {
    pub fn new(
        tasks: Arc<TaskStore>,
        epics: Arc<EpicStore>,
        dispatch: Arc<Dispatch>,
        hub: Hub,
        default_poll_deadline: Duration,
        defaults: DefaultsConfig,
    ) -> Self {
        Self {
            tasks,
            epics,
            dispatch,
            hub,
            default_poll_deadline,
            defaults,
        }
    }
}
