//! Process-wide bookkeeping of live runs.
//!
//! [`RunRegistry`] maps run ids to live process handles so that a `stop`
//! request can reach an in-flight run. The launcher is the only writer:
//! it registers a run before awaiting any child I/O and deregisters it
//! exactly once, when the process exit is observed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use jobmill_core::types::RunId;

/// Handle to one live run.
#[derive(Debug, Clone)]
pub struct LiveRun {
    /// OS pid of the child, for logs only. `None` if the process already
    /// reaped by the time the handle was built.
    pub pid: Option<u32>,
    /// Cancelled by [`RunRegistry::stop`]; the supervisor kills the
    /// child when it fires.
    pub cancel: CancellationToken,
}

/// Shared map of in-flight runs.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, LiveRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly spawned run.
    ///
    /// Returns `false` (keeping the existing handle) if the id is already
    /// present -- run ids are expected to be unique per execution, so a
    /// collision indicates a caller bug.
    pub async fn register(&self, run_id: RunId, run: LiveRun) -> bool {
        match self.runs.lock().await.entry(run_id) {
            Entry::Vacant(slot) => {
                slot.insert(run);
                true
            }
            Entry::Occupied(slot) => {
                tracing::warn!(run_id = %slot.key(), "Run id already registered, keeping existing handle");
                false
            }
        }
    }

    /// Remove the handle for `run_id`. Returns whether it was present.
    pub async fn deregister(&self, run_id: &str) -> bool {
        self.runs.lock().await.remove(run_id).is_some()
    }

    /// Signal an in-flight run to terminate.
    ///
    /// Advisory: this cancels the run's token and returns immediately;
    /// the eventual process exit drives deregistration and the failure
    /// report. Unknown or already-finished ids are a silent no-op, which
    /// makes `stop` idempotent and safe to race with natural exit.
    pub async fn stop(&self, run_id: &str) {
        let run = self.runs.lock().await.get(run_id).cloned();
        match run {
            Some(run) => {
                tracing::info!(run_id, pid = run.pid, "Stopping run");
                run.cancel.cancel();
            }
            None => {
                tracing::debug!(run_id, "Stop requested for unknown or finished run");
            }
        }
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.lock().await.contains_key(run_id)
    }

    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.lock().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn live_run() -> LiveRun {
        LiveRun {
            pid: Some(4242),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn register_then_deregister_exactly_once() {
        let registry = RunRegistry::new();
        assert!(registry.register("r1".into(), live_run()).await);
        assert!(registry.contains("r1").await);

        assert!(registry.deregister("r1").await);
        assert!(!registry.contains("r1").await);
        assert!(!registry.deregister("r1").await, "second removal is a no-op");
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_the_first_handle() {
        let registry = RunRegistry::new();
        let first = live_run();
        let token = first.cancel.clone();
        assert!(registry.register("r1".into(), first).await);
        assert!(!registry.register("r1".into(), live_run()).await);

        // Stopping still cancels the original token.
        registry.stop("r1").await;
        assert!(token.is_cancelled());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stop_cancels_the_token_but_does_not_deregister() {
        let registry = RunRegistry::new();
        let run = live_run();
        let token = run.cancel.clone();
        registry.register("r1".into(), run).await;

        registry.stop("r1").await;
        assert!(token.is_cancelled());
        // Deregistration only happens when the exit is observed.
        assert!(registry.contains("r1").await);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_for_unknown_ids() {
        let registry = RunRegistry::new();
        registry.stop("never-started").await;

        let run = live_run();
        registry.register("r1".into(), run).await;
        registry.stop("r1").await;
        registry.stop("r1").await;
        registry.deregister("r1").await;
        registry.stop("r1").await;
        assert!(registry.is_empty().await);
    }
}
