//! Pure transition-table predicates, grounded on `orchd/src/state_machine.rs`'s
//! `is_transition_allowed` match-based validator. The task/epic stores use
//! these as a sanity check before committing a transition; the actual
//! decision of *which* transition to take (which needs attempt counters and
//! worker-reported outcomes, not just the two endpoint states) lives in
//! `task_store.rs` / `epic_store.rs`.

use verve_core::{EpicStatus, TaskStatus};

/// Collapses the full transition table down to "is this (from, to) pair ever valid",
/// ignoring the trigger-specific side conditions (attempt counts, artifact
/// presence) that the callers check separately.
pub fn is_task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Review)
            | (Running, Closed)
            | (Running, Failed)
            | (Running, Pending)
            | (Review, Pending)
            | (Review, Merged)
            | (Review, Closed)
            // reconciler exhaustion: CI failure/merge conflict retry with no
            // attempts left.
            | (Review, Failed)
            | (Failed, Pending)
    )
}

pub fn is_epic_transition_allowed(from: EpicStatus, to: EpicStatus) -> bool {
    use EpicStatus::*;
    matches!(
        (from, to),
        (Planning, Draft)
            | (Planning, Planning)
            | (Draft, Planning)
            | (Draft, Active)
            | (Draft, Ready)
            | (Draft, Closed)
            | (Ready, Closed)
            | (Active, Completed)
    )
}
