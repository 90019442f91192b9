//! Message codec: parse inbound frames, build outbound frames.
//!
//! Pure module — no I/O, no shared state. `parse` takes `&str`;
//! `build_*` produce [`serde_json::Value`]. Unknown fields on a
//! recognized object are ignored, not preserved (forward-compatibility
//! is "ignore", not "round-trip").

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Inbound frame, as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Connect { session_id: Option<Uuid> },
    Graph { graph_data: Value },
    Stop,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Queued,
    Running,
    Finished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Start,
    Update,
    Done,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "MISSING_API_KEYS")]
    MissingApiKeys,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "EXECUTION_ERROR")]
    ExecutionError,
}

/// Outbound frame, as emitted to a client. Serializes with a `type`
/// discriminant matching the wire shapes in spec §6; optional fields
/// with no value are omitted rather than emitted as `null`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Session {
        session_id: Uuid,
    },
    Status {
        state: StatusState,
        message: String,
        job_id: u64,
    },
    QueuePosition {
        position: i64,
        job_id: u64,
    },
    Progress {
        node_id: String,
        state: ProgressState,
        job_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    Data {
        results: HashMap<String, HashMap<String, Value>>,
        job_id: u64,
    },
    Stopped {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<u64>,
    },
    Error {
        message: String,
        // `code` is explicitly nullable on the wire (spec §4.1: `code ∈
        // {MISSING_API_KEYS, VALIDATION_ERROR, EXECUTION_ERROR, null}`),
        // so unlike the other optional fields here it is serialized as
        // `null` rather than omitted.
        code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        missing_keys: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<u64>,
    },
    Pong,
}

impl OutboundFrame {
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("OutboundFrame serialization is infallible")
    }
}

/// Parse an inbound frame. Returns `None` for malformed JSON or an
/// unrecognized `type`. Tolerant of additional fields. Arms are
/// checked in the order `connect`, `graph`, `stop`, `ping` per the
/// codec's ordering rule.
pub fn parse(bytes: &str) -> Option<InboundFrame> {
    let value: Value = serde_json::from_str(bytes).ok()?;
    let obj = value.as_object()?;
    let ty = obj.get("type")?.as_str()?;

    if ty == "connect" {
        let session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        return Some(InboundFrame::Connect { session_id });
    }
    if ty == "graph" {
        let graph_data = obj.get("graph_data")?.clone();
        if !graph_data.is_object() {
            return None;
        }
        return Some(InboundFrame::Graph { graph_data });
    }
    if ty == "stop" {
        return Some(InboundFrame::Stop);
    }
    if ty == "ping" {
        return Some(InboundFrame::Ping);
    }
    None
}

pub fn build_session(session_id: Uuid) -> OutboundFrame {
    OutboundFrame::Session { session_id }
}

pub fn build_status(state: StatusState, message: impl Into<String>, job_id: u64) -> OutboundFrame {
    OutboundFrame::Status {
        state,
        message: message.into(),
        job_id,
    }
}

pub fn build_queue_position(position: i64, job_id: u64) -> OutboundFrame {
    OutboundFrame::QueuePosition { position, job_id }
}

pub fn build_progress(
    node_id: impl Into<String>,
    state: ProgressState,
    job_id: u64,
    progress: Option<u8>,
    text: Option<String>,
    meta: Option<Value>,
) -> OutboundFrame {
    OutboundFrame::Progress {
        node_id: node_id.into(),
        state,
        job_id,
        progress: progress.map(|p| p.min(100)),
        text,
        meta,
    }
}

pub fn build_data(results: HashMap<String, HashMap<String, Value>>, job_id: u64) -> OutboundFrame {
    OutboundFrame::Data { results, job_id }
}

pub fn build_stopped(message: impl Into<String>, job_id: Option<u64>) -> OutboundFrame {
    OutboundFrame::Stopped {
        message: message.into(),
        job_id,
    }
}

pub fn build_error(
    message: impl Into<String>,
    code: Option<ErrorCode>,
    missing_keys: Option<Vec<String>>,
    job_id: Option<u64>,
) -> OutboundFrame {
    OutboundFrame::Error {
        message: message.into(),
        code,
        missing_keys,
        job_id,
    }
}

pub fn build_pong() -> OutboundFrame {
    OutboundFrame::Pong
}

/// Inverse of `parse` for inbound frames, used only by the round-trip
/// property test below — the codec has no production need to
/// serialize inbound frames.
#[cfg(test)]
fn build_inbound(frame: &InboundFrame) -> String {
    match frame {
        InboundFrame::Connect { session_id } => match session_id {
            Some(id) => format!(r#"{{"type":"connect","session_id":"{id}"}}"#),
            None => r#"{"type":"connect"}"#.to_string(),
        },
        InboundFrame::Graph { graph_data } => {
            serde_json::json!({"type": "graph", "graph_data": graph_data}).to_string()
        }
        InboundFrame::Stop => r#"{"type":"stop"}"#.to_string(),
        InboundFrame::Ping => r#"{"type":"ping"}"#.to_string(),
    }
}
