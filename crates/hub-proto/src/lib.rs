//! Wire definitions for the match hub push channel.
//!
//! Messages are JSON objects terminated by the ASCII record separator (0x1E).
//! The crate does no IO so the client, test hubs, and tooling share one codec
//! without pulling in the async runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

const KIND_INVOCATION: u8 = 1;
const KIND_COMPLETION: u8 = 3;
const KIND_PING: u8 = 6;
const KIND_CLOSE: u8 = 7;

#[derive(Debug, Error)]
pub enum HubProtoError {
    #[error("malformed hub frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported hub message type {0}")]
    UnsupportedType(u8),
    #[error("hub message type {kind} missing field `{field}`")]
    MissingField { kind: u8, field: &'static str },
}

pub type HubProtoResult<T> = Result<T, HubProtoError>;

/// First frame a client sends after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

impl HandshakeRequest {
    pub fn encode(&self) -> HubProtoResult<String> {
        terminate(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> HubProtoResult<Self> {
        Ok(serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR))?)
    }
}

/// Server reply to the handshake. An empty object means accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
        }
    }

    pub fn encode(&self) -> HubProtoResult<String> {
        terminate(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> HubProtoResult<Self> {
        Ok(serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR))?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Named call in either direction. Server pushes carry no invocation id.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Acknowledgement for a client invocation; `error` set means rejected.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        HubMessage::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    pub fn push(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    pub fn encode(&self) -> HubProtoResult<String> {
        let raw = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawMessage {
                kind: KIND_INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..RawMessage::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawMessage {
                kind: KIND_COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..RawMessage::default()
            },
            HubMessage::Ping => RawMessage {
                kind: KIND_PING,
                ..RawMessage::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawMessage {
                kind: KIND_CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..RawMessage::default()
            },
        };
        terminate(serde_json::to_string(&raw)?)
    }

    /// Decodes a single frame; a trailing separator is tolerated.
    pub fn decode(frame: &str) -> HubProtoResult<Self> {
        let raw: RawMessage = serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR))?;
        match raw.kind {
            KIND_INVOCATION => Ok(HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(HubProtoError::MissingField {
                    kind: KIND_INVOCATION,
                    field: "target",
                })?,
                arguments: raw.arguments.unwrap_or_default(),
            }),
            KIND_COMPLETION => Ok(HubMessage::Completion {
                invocation_id: raw.invocation_id.ok_or(HubProtoError::MissingField {
                    kind: KIND_COMPLETION,
                    field: "invocationId",
                })?,
                result: raw.result,
                error: raw.error,
            }),
            KIND_PING => Ok(HubMessage::Ping),
            KIND_CLOSE => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Err(HubProtoError::UnsupportedType(other)),
        }
    }

    /// Targets are compared ignoring ASCII case; servers differ on casing.
    pub fn is_target(&self, name: &str) -> bool {
        matches!(self, HubMessage::Invocation { target, .. } if target.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

fn terminate(mut json: String) -> HubProtoResult<String> {
    json.push(RECORD_SEPARATOR);
    Ok(json)
}

/// Reassembles frames from a stream of text chunks. A transport message may
/// hold several frames, and a frame may be split across messages.
#[derive(Debug, Default)]
pub struct FrameReader {
    pending: String,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(idx) = self.pending.find(RECORD_SEPARATOR) {
            let frame: String = self.pending.drain(..=idx).collect();
            let frame = frame.trim_end_matches(RECORD_SEPARATOR);
            if !frame.trim().is_empty() {
                frames.push(frame.to_string());
            }
        }
        frames
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_encodes_type_and_separator() {
        let frame = HubMessage::invocation("7", "PauseMatch", vec![json!("m-1")])
            .encode()
            .expect("encode");
        assert!(frame.ends_with(RECORD_SEPARATOR));
        let value: Value = serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR))
            .expect("valid json");
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "7");
        assert_eq!(value["target"], "PauseMatch");
        assert_eq!(value["arguments"][0], "m-1");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn decodes_rejected_completion() {
        let msg = HubMessage::decode(r#"{"type":3,"invocationId":"4","error":"not your match"}"#)
            .expect("decode");
        assert_eq!(
            msg,
            HubMessage::Completion {
                invocation_id: "4".into(),
                result: None,
                error: Some("not your match".into()),
            }
        );
    }

    #[test]
    fn completion_without_id_is_rejected() {
        let err = HubMessage::decode(r#"{"type":3}"#).unwrap_err();
        assert!(matches!(
            err,
            HubProtoError::MissingField {
                field: "invocationId",
                ..
            }
        ));
    }

    #[test]
    fn stream_items_are_unsupported() {
        let err = HubMessage::decode(r#"{"type":2,"invocationId":"1","item":5}"#).unwrap_err();
        assert!(matches!(err, HubProtoError::UnsupportedType(2)));
    }

    #[test]
    fn close_defaults_to_no_reconnect() {
        let frame = format!(r#"{{"type":7}}{RECORD_SEPARATOR}"#);
        let msg = HubMessage::decode(&frame).expect("decode");
        assert_eq!(
            msg,
            HubMessage::Close {
                error: None,
                allow_reconnect: false
            }
        );
    }

    #[test]
    fn target_match_ignores_case() {
        let msg = HubMessage::push("receiveMatchState", vec![]);
        assert!(msg.is_target("ReceiveMatchState"));
        assert!(!msg.is_target("ReceiveMatchEvent"));
        assert!(!HubMessage::Ping.is_target("ReceiveMatchState"));
    }

    #[test]
    fn handshake_round_trip_and_rejection() {
        let request = HandshakeRequest::default().encode().expect("encode");
        assert_eq!(request, format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#));
        assert_eq!(
            HandshakeResponse::decode("{}\u{1e}").expect("decode"),
            HandshakeResponse::accepted()
        );
        let rejected = HandshakeResponse::decode(r#"{"error":"bad protocol"}"#).expect("decode");
        assert_eq!(rejected.error.as_deref(), Some("bad protocol"));
    }

    #[test]
    fn frame_reader_handles_split_and_batched_frames() {
        let mut reader = FrameReader::new();
        assert!(reader.push(r#"{"type":6}"#).is_empty());
        assert!(reader.has_partial());

        let frames = reader.push("\u{1e}{\"type\":6}\u{1e}{\"type\":");
        assert_eq!(frames.len(), 2);
        assert!(reader.has_partial());

        let frames = reader.push("7}\u{1e}");
        assert_eq!(frames, vec![r#"{"type":7}"#.to_string()]);
        assert!(!reader.has_partial());
    }
}
