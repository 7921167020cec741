//! Wire protocol shared by the TEM and camera services.
//!
//! Every request is one JSON frame:
//!
//! ```text
//! {"command": "set_stage_position", "params": {"x_nm": 1500.0}}
//! ```
//!
//! and every reply is one JSON frame tagged by `status`:
//!
//! ```text
//! {"status": "ok", "generation": 12, "result": {...}}
//! {"status": "error", "kind": "invalid_parameter", "message": "..."}
//! ```
//!
//! Camera acquisitions follow an `ok` header with one raw pixel frame per image.
//! See [`codec`] for the framing itself.

pub mod codec;

pub use codec::{read_frame, write_frame, FrameLimits, LENGTH_PREFIX_BYTES};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppResult, EmulatorError, ErrorKind};

/// Command names that end a session on either service.
pub const SESSION_END_COMMANDS: [&str; 2] = ["exit", "kill"];

/// A decoded but not yet interpreted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    /// Operation name, matched case-insensitively.
    pub command: String,
    /// Named arguments; `null` or missing means none.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RawRequest {
    /// Build a request for sending.
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }

    /// Parse a frame body. Anything that is not a JSON object with a `command` string
    /// is a protocol error.
    pub fn decode(body: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| EmulatorError::Protocol(format!("malformed request: {e}")))
    }

    /// Command name with case and `-`/`_` spelling normalized.
    pub fn name(&self) -> String {
        self.command.trim().to_ascii_lowercase().replace('-', "_")
    }

    /// True for the `exit`/`kill` sentinels.
    pub fn ends_session(&self) -> bool {
        SESSION_END_COMMANDS.contains(&self.name().as_str())
    }

    /// Deserialize `params` into the typed parameter set for the command.
    ///
    /// Missing params are treated as an empty object.
    pub fn params<T: DeserializeOwned>(&self) -> AppResult<T> {
        let params = if self.params.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.params.clone()
        };
        serde_json::from_value(params).map_err(|e| EmulatorError::invalid("params", e.to_string()))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> AppResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EmulatorError::Protocol(e.to_string()))
    }
}

/// Reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The request succeeded.
    Ok {
        /// Generation of the state the request saw or produced.
        generation: u64,
        /// Operation-specific payload.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        result: Value,
    },
    /// The request failed; nothing changed.
    Error {
        /// Error class.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl Response {
    /// Successful reply carrying `result`.
    pub fn ok(generation: u64, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self::Ok { generation, result },
            Err(e) => Self::Error {
                kind: ErrorKind::Internal,
                message: format!("could not encode result: {e}"),
            },
        }
    }

    /// Error reply for `err`.
    pub fn error(err: &EmulatorError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True for `status: ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Short status label for logs.
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Error { .. } => "error",
        }
    }

    /// Parse a response frame.
    pub fn decode(body: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| EmulatorError::Protocol(format!("malformed response: {e}")))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> AppResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EmulatorError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_normalizes_command_name() {
        let req = RawRequest::decode(br#"{"command": "Set-Stage-Position"}"#).unwrap();
        assert_eq!(req.name(), "set_stage_position");
        assert!(req.params.is_null());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = RawRequest::decode(b"not json").unwrap_err();
        assert!(matches!(err, EmulatorError::Protocol(_)));

        let err = RawRequest::decode(br#"{"params": {}}"#).unwrap_err();
        assert!(matches!(err, EmulatorError::Protocol(_)));
    }

    #[test]
    fn test_session_end_sentinels() {
        assert!(RawRequest::new("exit", Value::Null).ends_session());
        assert!(RawRequest::new("KILL", Value::Null).ends_session());
        assert!(!RawRequest::new("get_state", Value::Null).ends_session());
    }

    #[test]
    fn test_bad_params_are_invalid_parameter() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct P {
            value: u32,
        }
        let req = RawRequest::new("x", json!({"value": "high"}));
        let err = req.params::<P>().unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidParameter { .. }));
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = Response::ok(3, json!({"x_nm": 1.0}));
        let v: Value = serde_json::from_slice(&ok.encode().unwrap()).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["generation"], 3);

        let err = Response::error(&EmulatorError::UnknownCommand("FOO".into()));
        let v: Value = serde_json::from_slice(&err.encode().unwrap()).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["kind"], "unknown_command");
        assert_eq!(Response::decode(&err.encode().unwrap()).unwrap(), err);
    }
}
