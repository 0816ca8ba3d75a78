//! Process launcher and run supervisor.
//!
//! Spawns one child process per run with four piped streams -- stdin,
//! stdout, stderr, and the control channel on file descriptor 3 -- feeds
//! it the initial JSON payload, and supervises it until exit. Completion
//! is reported through a [`RunTicket`] that resolves exactly once; the
//! caller persists the resulting status transition.

use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use jobmill_core::messages::InitialPayload;
use jobmill_core::types::{DbId, RunId};

use crate::broker::{self, ControlHandler};
use crate::builder::{ENV_DIR_NAME, JOB_FILE_NAME};
use crate::config::EngineConfig;
use crate::registry::{LiveRun, RunRegistry};

/// File descriptor the child sees its control channel on.
const CONTROL_FD: RawFd = 3;

/// Everything needed to launch one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub job_id: DbId,
    pub run_id: RunId,
    /// Job parameters; `null` is replaced with `{}` in the payload.
    pub params: Value,
    /// Entity listing forwarded to the child untouched.
    pub entities: Value,
    /// Opaque state persisted by a previous run.
    pub state: Option<Value>,
    /// Task build directory containing `job.py` and the `env` directory.
    pub task_dir: PathBuf,
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Exit code 0. Carries the full accumulated stdout and the last
    /// state blob the child asked to store, if any.
    Success {
        output: String,
        state: Option<Value>,
    },
    /// Nonzero exit, kill, or spawn failure. The message names the cause
    /// and embeds both captured buffers.
    Failed { message: String },
}

/// Resolves exactly once with the run's outcome.
///
/// Dropping the ticket does not cancel the run; use
/// [`RunRegistry::stop`] for that.
pub struct RunTicket {
    receiver: oneshot::Receiver<RunOutcome>,
}

impl RunTicket {
    /// Wait for the run to finish.
    pub async fn outcome(self) -> RunOutcome {
        self.receiver.await.unwrap_or_else(|_| RunOutcome::Failed {
            message: "Run supervisor dropped without reporting an outcome".into(),
        })
    }
}

/// Accumulating stdout/stderr buffers shared across a run's reader tasks.
///
/// Stream-level errors are folded into the stderr buffer; a damaged pipe
/// degrades diagnostics but is not fatal by itself.
#[derive(Debug, Clone, Default)]
pub struct RunBuffers {
    output: Arc<std::sync::Mutex<String>>,
    errors: Arc<std::sync::Mutex<String>>,
}

impl RunBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_out(&self, text: &str) {
        if let Ok(mut buf) = self.output.lock() {
            buf.push_str(text);
        }
    }

    pub fn append_err(&self, text: &str) {
        if let Ok(mut buf) = self.errors.lock() {
            buf.push_str(text);
        }
    }

    pub fn output(&self) -> String {
        self.output.lock().map(|buf| buf.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> String {
        self.errors.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

/// Launches and supervises job processes.
pub struct JobRunner {
    config: EngineConfig,
    registry: Arc<RunRegistry>,
}

impl JobRunner {
    pub fn new(config: EngineConfig, registry: Arc<RunRegistry>) -> Self {
        Self { config, registry }
    }

    /// Spawn one run and supervise it in the background.
    ///
    /// The run is registered in the registry before any child I/O is
    /// awaited, so a `stop` arriving immediately after this returns is
    /// race-free with startup. A spawn failure registers nothing and
    /// resolves the ticket immediately.
    pub async fn spawn_run(&self, spec: RunSpec, handler: Arc<dyn ControlHandler>) -> RunTicket {
        let (done_tx, receiver) = oneshot::channel();
        let buffers = RunBuffers::new();

        let payload = InitialPayload {
            params: match spec.params {
                Value::Null => Value::Object(Default::default()),
                params => params,
            },
            entities: spec.entities,
            state: spec.state,
            es: self.config.es_connection(),
        };

        let (child, control) = match spawn_child(&spec.task_dir) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(
                    job_id = spec.job_id,
                    run_id = %spec.run_id,
                    error = %e,
                    "Failed to spawn job process",
                );
                let _ = done_tx.send(RunOutcome::Failed {
                    message: fail_message(&e.to_string(), &buffers),
                });
                return RunTicket { receiver };
            }
        };

        let cancel = CancellationToken::new();
        self.registry
            .register(
                spec.run_id.clone(),
                LiveRun {
                    pid: child.id(),
                    cancel: cancel.clone(),
                },
            )
            .await;

        tracing::info!(
            job_id = spec.job_id,
            run_id = %spec.run_id,
            pid = child.id(),
            "Job process started",
        );

        let registry = Arc::clone(&self.registry);
        let run_id = spec.run_id;
        tokio::spawn(async move {
            let outcome = supervise(child, control, payload, handler, buffers, cancel).await;
            // Removed exactly once: lookups for this id fail from here on.
            registry.deregister(&run_id).await;
            let _ = done_tx.send(outcome);
        });

        RunTicket { receiver }
    }
}

/// Spawn the task's interpreter with the control pipe on [`CONTROL_FD`].
fn spawn_child(task_dir: &Path) -> std::io::Result<(Child, pipe::Receiver)> {
    let (control_tx, control_rx) = pipe::pipe()?;
    // The child owns the write end as a plain blocking fd.
    let child_fd = control_tx.into_blocking_fd()?;
    let raw = child_fd.as_raw_fd();

    let python = task_dir.join(ENV_DIR_NAME).join("bin").join("python");
    let mut cmd = Command::new(python);
    cmd.arg(JOB_FILE_NAME)
        .current_dir(task_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Place the pipe's write end on fd 3 in the child. `dup2` clears
    // CLOEXEC on the duplicate; if the ends already coincide the flag
    // has to be cleared by hand.
    unsafe {
        cmd.pre_exec(move || {
            if raw == CONTROL_FD {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags == -1
                    || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw, CONTROL_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    // The parent must close its copy of the write end, or the control
    // reader never sees EOF.
    drop(child_fd);
    Ok((child, control_rx))
}

/// Drive one child process to completion and compose its outcome.
async fn supervise(
    mut child: Child,
    control: pipe::Receiver,
    payload: InitialPayload,
    handler: Arc<dyn ControlHandler>,
    buffers: RunBuffers,
    cancel: CancellationToken,
) -> RunOutcome {
    let Some(stdin) = child.stdin.take() else {
        return RunOutcome::Failed {
            message: fail_message("Child stdin was not piped", &buffers),
        };
    };
    let stdin = Arc::new(Mutex::new(stdin));

    let out_task = tokio::spawn(drain_stream(child.stdout.take(), buffers.clone(), false));
    let err_task = tokio::spawn(drain_stream(child.stderr.take(), buffers.clone(), true));

    // Send all configs and params to the process on stdin in JSON format.
    // Must complete before the broker starts: the payload has to be the
    // first message on stdin, ahead of any control response.
    {
        let mut line = serde_json::to_string(&payload).unwrap_or_default();
        line.push('\n');
        let mut stdin = stdin.lock().await;
        // Best-effort write; a child that closes stdin early surfaces
        // through the error buffer.
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            buffers.append_err(&e.to_string());
        }
    }

    let stored_state = Arc::new(std::sync::Mutex::new(None));
    let broker_task = tokio::spawn(broker::serve(
        control,
        Arc::clone(&stdin),
        handler,
        buffers.clone(),
        Arc::clone(&stored_state),
    ));

    // Wait for exit. A stop request turns into a kill, after which the
    // real exit event still drives completion.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            tracing::info!(pid = child.id(), "Stop requested, killing job process");
            if let Err(e) = child.start_kill() {
                buffers.append_err(&e.to_string());
            }
            child.wait().await
        }
    };

    // Drain the readers and the broker; they all end at stream EOF.
    let _ = out_task.await;
    let _ = err_task.await;
    let _ = broker_task.await;

    let stored = stored_state.lock().map(|slot| slot.clone()).unwrap_or(None);

    match status {
        Ok(status) if status.success() => RunOutcome::Success {
            output: buffers.output(),
            state: stored,
        },
        Ok(status) => {
            let cause = match status.code() {
                Some(code) => format!("Run failed with code {code}"),
                None => "Run failed: killed by signal".to_string(),
            };
            RunOutcome::Failed {
                message: fail_message(&cause, &buffers),
            }
        }
        Err(e) => RunOutcome::Failed {
            message: fail_message(&e.to_string(), &buffers),
        },
    }
}

/// Accumulate one output stream into the shared buffers until EOF.
///
/// Bytes are collected and decoded once at the end, so a multi-byte
/// UTF-8 sequence straddling a read boundary survives intact.
async fn drain_stream<R>(stream: Option<R>, buffers: RunBuffers, to_err: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else { return };
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) => {
                buffers.append_err(&e.to_string());
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&bytes);
    if to_err {
        buffers.append_err(&text);
    } else {
        buffers.append_out(&text);
    }
}

/// Compose the failure message the caller persists: the cause followed by
/// both captured buffers.
fn fail_message(cause: &str, buffers: &RunBuffers) -> String {
    [
        cause.to_string(),
        format!("Log:\n{}", buffers.output()),
        format!("Error log:\n{}", buffers.errors()),
    ]
    .join("\n\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
