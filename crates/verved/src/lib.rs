//! The `verved` daemon crate: SQLite-backed store adapter, task/epic stores,
//! the long-poll dispatch endpoint, the forge-outcome reconciler, and the
//! periodic staleness/completion sweeps. `verve-web` wraps this crate's
//! types in HTTP handlers; `main.rs` wires the pieces together and runs the
//! background loops.

pub mod dispatch;
pub mod epic_store;
pub mod persistence;
pub mod reconciler;
pub mod state_machine;
pub mod task_store;

pub use dispatch::{Dispatch, WorkEnvelope};
pub use epic_store::{EpicStore, TaskCreator, TaskStatusReader};
pub use persistence::SqliteStore;
pub use reconciler::Reconciler;
pub use task_store::TaskStore;
