//! Control-channel broker.
//!
//! Reads newline-delimited JSON requests arriving on the child's fourth
//! stream, dispatches each to the caller-supplied [`ControlHandler`], and
//! writes the handler's response, newline-terminated, back to the child's
//! stdin. A malformed or unsatisfiable request degrades the run's
//! diagnostics; it never terminates the run by itself -- the child decides
//! whether to exit after receiving an error-shaped response.
//!
//! The broker is generic over the transport, so tests drive it with
//! in-memory duplex streams instead of a real child process.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use jobmill_core::messages::{JobRequest, RequestError};

use crate::runner::RunBuffers;

/// Caller-supplied handler for structured requests from a running job.
///
/// Satisfying a request (creating signal sets, persisting state) needs
/// the persistence layer, which lives outside the engine; the engine only
/// moves the messages.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Produce the JSON response for one request.
    ///
    /// An `Err` is appended to the run's error log and no response is
    /// written for that request; the run continues.
    async fn handle(&self, request: JobRequest) -> anyhow::Result<Value>;
}

/// Serve the control channel until the stream reaches EOF.
///
/// Requests are processed strictly in arrival order (each handler call is
/// awaited before the next line is read). The last `store` request seen
/// is recorded into `stored_state` so the launcher can surface it to the
/// caller on success.
pub async fn serve<R, W>(
    control: R,
    stdin: Arc<Mutex<W>>,
    handler: Arc<dyn ControlHandler>,
    buffers: RunBuffers,
    stored_state: Arc<std::sync::Mutex<Option<Value>>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(control).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                // A damaged control pipe is reported through the buffered
                // text, not as a run failure.
                buffers.append_err(&e.to_string());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match JobRequest::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "Discarding unparseable control request");
                let reply = serde_json::to_value(RequestError::parsing(&e)).unwrap_or_default();
                write_response(&stdin, &reply, &buffers).await;
                continue;
            }
        };

        if let JobRequest::StoreState { config } = &request {
            if let Ok(mut slot) = stored_state.lock() {
                *slot = Some(config.clone());
            }
        }

        match handler.handle(request).await {
            Ok(response) => write_response(&stdin, &response, &buffers).await,
            Err(e) => buffers.append_err(&e.to_string()),
        }
    }
}

/// Write one newline-terminated response to the child's stdin. Write
/// failures (the child may already be gone) land in the error buffer.
async fn write_response<W>(stdin: &Arc<Mutex<W>>, response: &Value, buffers: &RunBuffers)
where
    W: AsyncWrite + Unpin,
{
    let mut line = response.to_string();
    line.push('\n');

    let mut stdin = stdin.lock().await;
    if let Err(e) = stdin.write_all(line.as_bytes()).await {
        buffers.append_err(&e.to_string());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    use super::*;

    /// Handler that records every request and replies with a fixed value.
    struct RecordingHandler {
        seen: std::sync::Mutex<Vec<JobRequest>>,
        reply: Value,
    }

    impl RecordingHandler {
        fn new(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
                reply,
            })
        }

        fn seen(&self) -> Vec<JobRequest> {
            self.seen.lock().expect("not poisoned").clone()
        }
    }

    #[async_trait]
    impl ControlHandler for RecordingHandler {
        async fn handle(&self, request: JobRequest) -> anyhow::Result<Value> {
            self.seen.lock().expect("not poisoned").push(request);
            Ok(self.reply.clone())
        }
    }

    /// Handler that always fails.
    struct FailingHandler;

    #[async_trait]
    impl ControlHandler for FailingHandler {
        async fn handle(&self, _request: JobRequest) -> anyhow::Result<Value> {
            anyhow::bail!("signal set creation refused")
        }
    }

    struct BrokerRig {
        control_tx: tokio::io::DuplexStream,
        stdin_rx: tokio::io::DuplexStream,
        buffers: RunBuffers,
        stored: Arc<std::sync::Mutex<Option<Value>>>,
        broker: tokio::task::JoinHandle<()>,
    }

    /// Wire a broker to in-memory transports.
    fn rig(handler: Arc<dyn ControlHandler>) -> BrokerRig {
        let (control_tx, control_rx) = tokio::io::duplex(4096);
        let (stdin_tx, stdin_rx) = tokio::io::duplex(4096);
        let buffers = RunBuffers::new();
        let stored = Arc::new(std::sync::Mutex::new(None));

        let broker = tokio::spawn(serve(
            control_rx,
            Arc::new(Mutex::new(stdin_tx)),
            handler,
            buffers.clone(),
            Arc::clone(&stored),
        ));

        BrokerRig {
            control_tx,
            stdin_rx,
            buffers,
            stored,
            broker,
        }
    }

    async fn read_stdin_to_end(mut stdin_rx: tokio::io::DuplexStream) -> String {
        let mut written = String::new();
        stdin_rx
            .read_to_string(&mut written)
            .await
            .expect("stdin transport readable");
        written
    }

    #[tokio::test]
    async fn responses_are_written_newline_terminated() {
        let handler = RecordingHandler::new(json!({"index": "sig_7", "fields": {"a": "f1"}}));
        let mut rig = rig(handler.clone());

        rig.control_tx
            .write_all(b"{\"type\":\"sets\",\"sigSet\":{\"cid\":\"a\"}}\n")
            .await
            .expect("control transport writable");
        drop(rig.control_tx);
        rig.broker.await.expect("broker finishes at EOF");

        let written = read_stdin_to_end(rig.stdin_rx).await;
        assert!(written.ends_with('\n'));
        let response: Value =
            serde_json::from_str(written.trim()).expect("response is one JSON object");
        assert_eq!(response["index"], "sig_7");
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test]
    async fn store_requests_record_the_state_blob() {
        let handler = RecordingHandler::new(json!({}));
        let mut rig = rig(handler.clone());

        rig.control_tx
            .write_all(b"{\"type\":\"store\",\"config\":{\"last\":42}}\n")
            .await
            .expect("control transport writable");
        drop(rig.control_tx);
        rig.broker.await.expect("broker finishes at EOF");

        assert_eq!(
            rig.stored.lock().expect("not poisoned").clone(),
            Some(json!({"last": 42}))
        );
        assert_eq!(
            handler.seen(),
            vec![JobRequest::StoreState {
                config: json!({"last": 42})
            }]
        );
    }

    #[tokio::test]
    async fn unparseable_requests_get_an_error_shaped_response() {
        let handler = RecordingHandler::new(json!({}));
        let mut rig = rig(handler.clone());

        rig.control_tx
            .write_all(b"definitely not json\n")
            .await
            .expect("control transport writable");
        drop(rig.control_tx);
        rig.broker.await.expect("broker finishes at EOF");

        let written = read_stdin_to_end(rig.stdin_rx).await;
        let response: Value = serde_json::from_str(written.trim()).expect("error reply is JSON");
        assert!(response["error"]
            .as_str()
            .expect("error is a string")
            .starts_with("Request parsing failed: "));
        assert!(handler.seen().is_empty(), "handler never sees garbage");
    }

    #[tokio::test]
    async fn handler_failures_land_in_the_error_buffer_without_a_response() {
        let mut rig = rig(Arc::new(FailingHandler));

        rig.control_tx
            .write_all(b"{\"type\":\"store\",\"config\":{}}\n")
            .await
            .expect("control transport writable");
        drop(rig.control_tx);
        rig.broker.await.expect("broker finishes at EOF");

        assert!(rig.buffers.errors().contains("signal set creation refused"));
        let written = read_stdin_to_end(rig.stdin_rx).await;
        assert!(written.is_empty(), "no response for a failed request");
    }

    #[tokio::test]
    async fn requests_are_processed_in_arrival_order() {
        let handler = RecordingHandler::new(json!({}));
        let mut rig = rig(handler.clone());

        rig.control_tx
            .write_all(
                b"{\"type\":\"store\",\"config\":1}\n{\"type\":\"store\",\"config\":2}\n{\"type\":\"store\",\"config\":3}\n",
            )
            .await
            .expect("control transport writable");
        drop(rig.control_tx);
        rig.broker.await.expect("broker finishes at EOF");

        let configs: Vec<Value> = handler
            .seen()
            .into_iter()
            .map(|request| match request {
                JobRequest::StoreState { config } => config,
                other => panic!("unexpected request: {other:?}"),
            })
            .collect();
        assert_eq!(configs, vec![json!(1), json!(2), json!(3)]);
    }
}
