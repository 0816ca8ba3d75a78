//! Environment builder.
//!
//! Materializes a task's code into an isolated, dependency-installed
//! execution environment. First-time provisioning ([`TaskBuilder::init`])
//! creates a virtualenv and installs the task type's package set;
//! code-only rebuilds ([`TaskBuilder::build`]) just replace the job file.
//! Both stage their work in a disposable sibling directory and swap
//! results into place only after success, so a failed attempt never
//! corrupts a previously working environment.

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::fs;
use tokio::process::Command;
use tokio::sync::oneshot;
use uuid::Uuid;

use jobmill_core::task::{packages_for_type, TaskType};
use jobmill_core::types::DbId;

use crate::config::EngineConfig;

/// File name of every build output.
pub const JOB_FILE_NAME: &str = "job.py";
/// Directory name the virtualenv is saved under inside a task directory.
pub const ENV_DIR_NAME: &str = "env";

/// Terminal result of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    /// The diagnostic log: captured installer output for install-phase
    /// failures, the error text for filesystem failures.
    Failed { log: String },
}

/// Resolves exactly once with the attempt's outcome.
pub struct BuildTicket {
    receiver: oneshot::Receiver<BuildOutcome>,
}

impl BuildTicket {
    /// Wait for the build to finish.
    pub async fn outcome(self) -> BuildOutcome {
        self.receiver.await.unwrap_or_else(|_| BuildOutcome::Failed {
            log: "Build task dropped without reporting an outcome".into(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum BuildError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Init ended with code {code} and the following error:\n{output}")]
    InstallFailed { code: i32, output: String },

    #[error("Task environment missing at {0}, init required")]
    MissingEnvironment(PathBuf),
}

impl BuildError {
    fn into_log(self) -> String {
        self.to_string()
    }
}

/// Provisions and rebuilds task environments.
pub struct TaskBuilder {
    config: EngineConfig,
}

impl TaskBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// First-time provisioning: create a virtualenv, install the package
    /// set for `task_type`, deposit `code`, then atomically replace
    /// `dest_dir` with the result.
    ///
    /// The attempt runs in the background; must be called from within a
    /// Tokio runtime. On failure `dest_dir` is left exactly as it was.
    pub fn init(
        &self,
        task_id: DbId,
        task_type: Option<TaskType>,
        code: String,
        dest_dir: PathBuf,
    ) -> BuildTicket {
        let (done_tx, receiver) = oneshot::channel();
        let python_bin = self.config.python_bin.clone();

        tokio::spawn(async move {
            let outcome = match init_task(&python_bin, task_type, &code, &dest_dir).await {
                Ok(()) => {
                    tracing::info!(task_id, dest = %dest_dir.display(), "Task environment initialized");
                    BuildOutcome::Success
                }
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Task init failed");
                    BuildOutcome::Failed { log: e.into_log() }
                }
            };
            let _ = done_tx.send(outcome);
        });

        BuildTicket { receiver }
    }

    /// Code-only rebuild for an already-initialized task: stage the new
    /// job file in a disposable directory, then move it over the existing
    /// one. The environment and its dependencies are left untouched.
    pub fn build(&self, task_id: DbId, code: String, dest_dir: PathBuf) -> BuildTicket {
        let (done_tx, receiver) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = match rebuild_code(&code, &dest_dir).await {
                Ok(()) => {
                    tracing::info!(task_id, dest = %dest_dir.display(), "Task code rebuilt");
                    BuildOutcome::Success
                }
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Task rebuild failed");
                    BuildOutcome::Failed { log: e.into_log() }
                }
            };
            let _ = done_tx.send(outcome);
        });

        BuildTicket { receiver }
    }
}

async fn init_task(
    python_bin: &str,
    task_type: Option<TaskType>,
    code: &str,
    dest_dir: &Path,
) -> Result<(), BuildError> {
    let build_dir = disposable_sibling(dest_dir, "build");
    let result = provision(python_bin, task_type, code, dest_dir, &build_dir).await;
    // Partial artifacts never leak onto disk, success or failure.
    let _ = fs::remove_dir_all(&build_dir).await;
    result
}

async fn provision(
    python_bin: &str,
    task_type: Option<TaskType>,
    code: &str,
    dest_dir: &Path,
    build_dir: &Path,
) -> Result<(), BuildError> {
    fs::create_dir_all(build_dir).await?;
    fs::write(build_dir.join(JOB_FILE_NAME), code).await?;

    let env_dir = build_dir.join(ENV_DIR_NAME);
    let mut captured = String::new();

    let venv = Command::new(python_bin)
        .arg("-m")
        .arg("venv")
        .arg(&env_dir)
        .output()
        .await?;
    append_captured(&mut captured, &venv);
    if !venv.status.success() {
        return Err(BuildError::InstallFailed {
            code: venv.status.code().unwrap_or(-1),
            output: captured,
        });
    }

    let pip = env_dir.join("bin").join("pip");
    let install = Command::new(&pip)
        .arg("install")
        .args(packages_for_type(task_type))
        .output()
        .await?;
    append_captured(&mut captured, &install);
    if !install.status.success() {
        return Err(BuildError::InstallFailed {
            code: install.status.code().unwrap_or(-1),
            output: captured,
        });
    }

    swap_into_place(build_dir, dest_dir).await
}

async fn rebuild_code(code: &str, dest_dir: &Path) -> Result<(), BuildError> {
    if fs::metadata(dest_dir).await.is_err() {
        return Err(BuildError::MissingEnvironment(dest_dir.to_path_buf()));
    }

    let build_dir = disposable_sibling(dest_dir, "build");
    let result = async {
        fs::create_dir_all(&build_dir).await?;
        let staged = build_dir.join(JOB_FILE_NAME);
        fs::write(&staged, code).await?;
        fs::rename(&staged, dest_dir.join(JOB_FILE_NAME)).await?;
        Ok(())
    }
    .await;
    let _ = fs::remove_dir_all(&build_dir).await;
    result
}

/// Replace `dest_dir` with the fully built `build_dir`.
///
/// The previous environment is moved aside first and deleted only after
/// the new one is in place; if the swap fails midway the previous
/// environment is restored.
async fn swap_into_place(build_dir: &Path, dest_dir: &Path) -> Result<(), BuildError> {
    if let Some(parent) = dest_dir.parent() {
        fs::create_dir_all(parent).await?;
    }

    let old_dir = disposable_sibling(dest_dir, "old");
    let had_previous = fs::metadata(dest_dir).await.is_ok();
    if had_previous {
        fs::rename(dest_dir, &old_dir).await?;
    }

    if let Err(e) = fs::rename(build_dir, dest_dir).await {
        if had_previous {
            let _ = fs::rename(&old_dir, dest_dir).await;
        }
        return Err(e.into());
    }

    if had_previous {
        let _ = fs::remove_dir_all(&old_dir).await;
    }
    Ok(())
}

/// Unique sibling path of `dest_dir` for disposable build/backup
/// directories. Uniqueness keeps concurrent attempts from aliasing each
/// other's staging area.
fn disposable_sibling(dest_dir: &Path, kind: &str) -> PathBuf {
    let name = dest_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".into());
    let parent = dest_dir.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{name}-{kind}-{}", Uuid::new_v4()))
}

/// Fold one command's interleaved stdout and stderr into the diagnostic.
fn append_captured(captured: &mut String, output: &Output) {
    captured.push_str(&String::from_utf8_lossy(&output.stdout));
    captured.push_str(&String::from_utf8_lossy(&output.stderr));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposable_siblings_never_alias() {
        let dest = Path::new("/tasks/7/files");
        let a = disposable_sibling(dest, "build");
        let b = disposable_sibling(dest, "build");
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/tasks/7")));
        assert!(a
            .file_name()
            .expect("has a name")
            .to_string_lossy()
            .starts_with(".files-build-"));
    }

    #[test]
    fn disposable_sibling_of_a_bare_name_stays_relative() {
        let path = disposable_sibling(Path::new("files"), "old");
        assert!(path.to_string_lossy().starts_with(".files-old-"));
    }
}
