//! Task model and the build-state machine.
//!
//! A task is a piece of user-supplied code plus the isolated environment
//! it runs in. The environment is provisioned once (`Uninitialized ->
//! Initializing`) and afterwards only the code file is rebuilt
//! (`Scheduled -> Processing`). Both walks end in `Finished` or `Failed`,
//! and `Failed` is always retry-eligible.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::DbId;

/// Declared task type. Selects the package set installed into the
/// task's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Python,
    Numpy,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::Numpy => write!(f, "numpy"),
        }
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "numpy" => Ok(Self::Numpy),
            other => Err(CoreError::Validation(format!("Unknown task type: {other}"))),
        }
    }
}

/// Package set installed for a task type.
///
/// Unrecognized or absent types fall back to the baseline set, so a task
/// of an unknown type still gets a working environment.
pub fn packages_for_type(task_type: Option<TaskType>) -> &'static [&'static str] {
    match task_type {
        Some(TaskType::Numpy) => &["elasticsearch", "numpy"],
        _ => &["elasticsearch"],
    }
}

/// Build lifecycle of a task's execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// No environment exists yet.
    Uninitialized,
    /// First-time provisioning is in flight.
    Initializing,
    /// A code-only rebuild has been queued.
    Scheduled,
    /// A code-only rebuild is in flight.
    Processing,
    Finished,
    Failed,
}

impl BuildState {
    /// States describing an in-flight build attempt. At most one build
    /// may be in a transitional state per task.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Initializing | Self::Processing | Self::Scheduled)
    }

    /// Terminal for a given attempt.
    pub fn is_final(self) -> bool {
        !self.is_transitional()
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Finished` and `Failed` accept both a rebuild (`Scheduled`) and a
    /// from-scratch re-init (`Initializing`).
    pub fn can_transition_to(self, next: Self) -> bool {
        use BuildState::{Failed, Finished, Initializing, Processing, Scheduled, Uninitialized};
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Finished)
                | (Initializing, Failed)
                | (Finished, Scheduled)
                | (Failed, Scheduled)
                | (Finished, Initializing)
                | (Failed, Initializing)
                | (Scheduled, Processing)
                | (Processing, Finished)
                | (Processing, Failed)
        )
    }

    /// Checked transition.
    pub fn transition_to(self, next: Self) -> Result<Self, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}

/// Ordered diagnostics captured from a build attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildDiagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl BuildDiagnostics {
    /// Diagnostics consisting of a single error entry, the common case
    /// for install and filesystem failures.
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// A user-supplied task: code plus the environment it runs in.
///
/// The engine never stores tasks; the record is owned by the caller and
/// passed in piecewise (`code`, `task_type`, build directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: DbId,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Opaque task settings (parameter declarations etc.) interpreted by
    /// the caller.
    pub settings: Value,
    pub code: String,
    pub build_state: BuildState,
    /// Diagnostics from the most recent build attempt, if any.
    pub build_output: Option<BuildDiagnostics>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
