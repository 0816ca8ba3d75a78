//! Engine facade consumed by the scheduler layer.
//!
//! One [`JobEngine`] per host process. Operations return tickets
//! ([`BuildTicket`], [`RunTicket`]) that resolve exactly once instead of
//! taking callback pairs; invocation and completion stay decoupled, and
//! the caller persists the state transitions the tickets report.

use std::path::Path;
use std::sync::Arc;

use jobmill_core::task::TaskType;
use jobmill_core::types::DbId;

use crate::broker::ControlHandler;
use crate::builder::{BuildTicket, TaskBuilder};
use crate::config::EngineConfig;
use crate::registry::RunRegistry;
use crate::runner::{JobRunner, RunSpec, RunTicket};

pub struct JobEngine {
    builder: TaskBuilder,
    runner: JobRunner,
    registry: Arc<RunRegistry>,
}

impl JobEngine {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(RunRegistry::new());
        Self {
            builder: TaskBuilder::new(config.clone()),
            runner: JobRunner::new(config, Arc::clone(&registry)),
            registry,
        }
    }

    /// First-time provisioning of a task's environment into `dest_dir`.
    pub fn init(
        &self,
        task_id: DbId,
        task_type: Option<TaskType>,
        code: &str,
        dest_dir: &Path,
    ) -> BuildTicket {
        self.builder
            .init(task_id, task_type, code.to_string(), dest_dir.to_path_buf())
    }

    /// Code-only rebuild into an already-initialized `dest_dir`.
    pub fn build(&self, task_id: DbId, code: &str, dest_dir: &Path) -> BuildTicket {
        self.builder
            .build(task_id, code.to_string(), dest_dir.to_path_buf())
    }

    /// Launch one run. The control-request handler is caller-supplied
    /// because satisfying requests needs the persistence layer.
    pub async fn run(&self, spec: RunSpec, handler: Arc<dyn ControlHandler>) -> RunTicket {
        self.runner.spawn_run(spec, handler).await
    }

    /// Signal an in-flight run to terminate. Unknown or finished ids are
    /// a silent no-op.
    pub async fn stop(&self, run_id: &str) {
        self.registry.stop(run_id).await;
    }

    /// Per-task cleanup hook. The task directory is owned by the caller
    /// and the registry tracks runs, not tasks, so there is nothing to
    /// release here; kept for API symmetry with `init`.
    pub async fn remove(&self, _task_id: DbId) {}

    /// Shared run registry, for callers that track run liveness.
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }
}
