//! Job and run models with the run-status machine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::{DbId, RunId, Timestamp};

/// Whether a job is eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Disabled,
    Enabled,
    /// Set by the caller when the job's parameters no longer validate
    /// against the task's current settings.
    InvalidParams,
}

/// When and how often a job should fire.
///
/// Interpreted by the trigger scheduler outside this workspace; carried
/// here because it is part of the persisted job record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Periodic trigger interval in seconds.
    pub interval_secs: Option<u64>,
    /// Minimum gap between two runs in seconds.
    pub min_gap_secs: Option<u64>,
    /// Delay between receiving a trigger and starting the run, in seconds.
    pub delay_secs: Option<u64>,
    /// Upstream signal sets whose updates fire this job.
    #[serde(default)]
    pub signal_sets: Vec<DbId>,
}

/// A job binds a task to a parameter set and a trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: DbId,
    pub name: String,
    /// The task this job executes.
    pub task: DbId,
    /// Parameter map fed to the child process in the initial payload.
    pub params: Value,
    pub state: JobState,
    pub trigger: TriggerConfig,
}

/// Lifecycle of one run.
///
/// Statuses advance monotonically through the declared order; any
/// non-terminal status may jump straight to `Failed`. A stopped run ends
/// in `Failed` as well -- there is no separate cancelled terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialization,
    Scheduled,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether a `stop` request makes sense in this status.
    pub fn accepts_stop(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Self::Initialization, Self::Scheduled)
                | (Self::Scheduled, Self::Running)
                | (Self::Running, Self::Success)
        )
    }

    /// Checked advance.
    pub fn advance_to(self, next: Self) -> Result<Self, CoreError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}

/// One live or finished execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// The owning job.
    pub job: DbId,
    pub status: RunStatus,
    /// Accumulated stdout of the child process.
    pub output: String,
    /// Accumulated stderr plus stream and handler errors.
    pub errors: String,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Run {
    /// Fresh run record for a newly accepted execution.
    pub fn new(id: RunId, job: DbId) -> Self {
        Self {
            id,
            job,
            status: RunStatus::Initialization,
            output: String::new(),
            errors: String::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
