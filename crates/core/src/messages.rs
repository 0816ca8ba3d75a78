//! Wire types of the child-process control protocol.
//!
//! The child receives one [`InitialPayload`] on stdin, newline-terminated,
//! immediately after spawn. It may then write newline-delimited JSON
//! requests to its fourth stream; each is answered with one
//! newline-delimited JSON object back on stdin. Responses correlate by
//! message content, not arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Address of the external data service, forwarded verbatim to the child.
///
/// `port` is a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsConnection {
    pub host: String,
    pub port: String,
}

/// First message written to the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPayload {
    /// Job parameters; `{}` when the job declares none.
    pub params: Value,
    /// Entity listing the child may reference (signal sets, signals).
    pub entities: Value,
    /// Opaque state persisted by a previous run, if any.
    pub state: Option<Value>,
    pub es: EsConnection,
}

/// A structured request read from the child's control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobRequest {
    /// Create a computed signal set (and its signals) on the child's
    /// behalf. The response carries either the assigned index and field
    /// mappings or an `error` string, in which case the child is expected
    /// to exit non-zero.
    #[serde(rename = "sets")]
    CreateSignalSets {
        #[serde(rename = "sigSet")]
        sig_set: Value,
    },
    /// Persist an opaque state blob for the job. Round-tripped back to
    /// the next run through [`InitialPayload::state`].
    #[serde(rename = "store")]
    StoreState { config: Value },
}

impl JobRequest {
    /// Parse one newline-delimited request line.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Error-shaped response written when a request cannot be parsed or
/// satisfied. The child decides whether to abort after receiving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub error: String,
}

impl RequestError {
    pub fn parsing(err: &serde_json::Error) -> Self {
        Self {
            error: format!("Request parsing failed: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn initial_payload_wire_shape() {
        let payload = InitialPayload {
            params: json!({"window": 3}),
            entities: json!({}),
            state: None,
            es: EsConnection {
                host: "localhost".into(),
                port: "9200".into(),
            },
        };

        let wire: Value = serde_json::to_value(&payload).expect("serializable");
        assert_eq!(wire["params"]["window"], 3);
        assert!(wire["state"].is_null());
        assert_eq!(wire["es"]["host"], "localhost");
        assert_eq!(wire["es"]["port"], "9200", "port travels as a string");
    }

    #[test]
    fn parses_store_request() {
        let request = JobRequest::parse(r#"{"type":"store","config":{"last":42}}"#)
            .expect("valid store request");
        assert_eq!(
            request,
            JobRequest::StoreState {
                config: json!({"last": 42})
            }
        );
    }

    #[test]
    fn parses_sets_request_with_wire_field_name() {
        let request = JobRequest::parse(r#"{"type":"sets","sigSet":{"cid":"made_up"}}"#)
            .expect("valid sets request");
        assert_eq!(
            request,
            JobRequest::CreateSignalSets {
                sig_set: json!({"cid": "made_up"})
            }
        );
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let err = JobRequest::parse(r#"{"type":"shrug"}"#).expect_err("unknown discriminant");
        let reply = RequestError::parsing(&err);
        assert!(reply.error.starts_with("Request parsing failed: "));
    }

    #[test]
    fn garbage_line_is_rejected() {
        assert!(JobRequest::parse("not json at all").is_err());
    }
}
