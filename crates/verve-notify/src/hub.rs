use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify, RwLock};

use verve_core::{EpicId, TaskId};

use crate::types::TaskEvent;

/// Bounded capacity for a task's event broadcaster. Slow subscribers fall
/// behind and see `RecvError::Lagged`, which they should treat as "resync
/// from persisted logs" — the append path never blocks on a subscriber.
const TASK_EVENTS_CAPACITY: usize = 256;

struct Inner {
    task_pending: Notify,
    epic_pending: Notify,
    epic_feedback: RwLock<HashMap<EpicId, Arc<Notify>>>,
    task_events: RwLock<HashMap<TaskId, broadcast::Sender<TaskEvent>>>,
}

/// The process-wide notification plane (C2): four broadcasters
/// that exist purely to bound dispatch latency. None of them carry
/// authoritative state — every wake-up re-reads the store, so a dropped or
/// coalesced signal is never a correctness bug, only a (harmless) extra
/// scan.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                task_pending: Notify::new(),
                epic_pending: Notify::new(),
                epic_feedback: RwLock::new(HashMap::new()),
                task_events: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Non-blocking; if a permit is already pending it is simply reused
    /// (coalesced) rather than stacked.
    pub fn notify_task_pending(&self) {
        self.inner.task_pending.notify_one();
    }

    pub fn notify_epic_pending(&self) {
        self.inner.epic_pending.notify_one();
    }

    /// Waits for the next task-pending or epic-pending signal, up to
    /// `deadline`. Returns `true` if a signal arrived, `false` on timeout.
    /// Callers must always re-scan the store regardless of the return
    /// value — the signal only bounds latency, it does not carry state.
    pub async fn wait_dispatch(&self, deadline: Duration) -> bool {
        let task_listen = self.inner.task_pending.notified();
        let epic_listen = self.inner.epic_pending.notified();
        tokio::select! {
            _ = task_listen => true,
            _ = epic_listen => true,
            _ = tokio::time::sleep(deadline) => false,
        }
    }

    async fn epic_feedback_signal(&self, epic_id: &EpicId) -> Arc<Notify> {
        if let Some(existing) = self.inner.epic_feedback.read().await.get(epic_id) {
            return existing.clone();
        }
        let mut signals = self.inner.epic_feedback.write().await;
        signals
            .entry(epic_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub async fn notify_epic_feedback(&self, epic_id: &EpicId) {
        self.epic_feedback_signal(epic_id).await.notify_one();
    }

    /// Waits for the next feedback signal on this epic, up to `deadline`.
    pub async fn wait_epic_feedback(&self, epic_id: &EpicId, deadline: Duration) -> bool {
        let signal = self.epic_feedback_signal(epic_id).await;
        tokio::select! {
            _ = signal.notified() => true,
            _ = tokio::time::sleep(deadline) => false,
        }
    }

    /// Drops the per-epic feedback signal. Called when an epic transitions
    /// to a terminal state.
    pub async fn remove_epic_feedback(&self, epic_id: &EpicId) {
        self.inner.epic_feedback.write().await.remove(epic_id);
    }

    async fn task_events_sender(&self, task_id: &TaskId) -> broadcast::Sender<TaskEvent> {
        if let Some(existing) = self.inner.task_events.read().await.get(task_id) {
            return existing.clone();
        }
        let mut senders = self.inner.task_events.write().await;
        senders
            .entry(task_id.clone())
            .or_insert_with(|| broadcast::channel(TASK_EVENTS_CAPACITY).0)
            .clone()
    }

    pub async fn subscribe_task_events(&self, task_id: &TaskId) -> broadcast::Receiver<TaskEvent> {
        self.task_events_sender(task_id).await.subscribe()
    }

    /// Fire-and-forget publish. `send` only errors when there are zero
    /// receivers, which is not a failure — nobody is tailing this task
    /// right now, and the persisted log remains the source of truth.
    pub async fn publish_task_event(&self, task_id: &TaskId, event: TaskEvent) {
        let sender = self.task_events_sender(task_id).await;
        let _ = sender.send(event);
    }

    /// Called on task deletion ("start over" also clears persisted logs,
    /// but the broadcaster itself is only torn down on delete since a
    /// retried task keeps streaming to the same viewers).
    pub async fn remove_task_events(&self, task_id: &TaskId) {
        self.inner.task_events.write().await.remove(task_id);
    }
}
