// ===============================
// src/error.rs
// ===============================
//
// Error taxonomy of the gateway:
// - Transport / ConnectionClosed : link-level, fans out to every pending call
// - Protocol                     : malformed inbound frame, logged + dropped
// - Rpc                          : venue error inside a reply, stays with its call
// - Auth                         : credential rejection / not logged in
// - Delivery                     : one downstream client, never the whole broadcast
//
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::broadcast::ConnId;

/// Malformed or unrecognized inbound frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unrecognized frame shape: {0}")]
    Unrecognized(String),
}

/// Error object carried by a venue reply: `{code, message, data?}`.
#[derive(Debug, Error, Clone, PartialEq, Deserialize)]
#[error("venue error {code}: {message}")]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("credentials rejected: {0}")]
    Rejected(RpcError),
    #[error("unexpected auth response: {0}")]
    BadResponse(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("not authenticated")]
    NotAuthenticated,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    #[error("send buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
    #[error("unknown connection")]
    UnknownConnection,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("delivery to downstream #{conn} failed: {reason}")]
    Delivery { conn: ConnId, reason: DeliveryFailure },

    #[error("{method} (id {id}) timed out after {after:?}")]
    Timeout { id: u64, method: String, after: Duration },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Link-level failures that say nothing about the request itself.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::ConnectionClosed(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_deserializes_without_data() {
        let e: RpcError =
            serde_json::from_str(r#"{"code":13004,"message":"invalid_credentials"}"#).unwrap();
        assert_eq!(e.code, 13004);
        assert_eq!(e.message, "invalid_credentials");
        assert!(e.data.is_none());
        assert_eq!(e.to_string(), "venue error 13004: invalid_credentials");
    }

    #[test]
    fn connection_level_classification() {
        assert!(GatewayError::ConnectionClosed("x".into()).is_connection_level());
        assert!(GatewayError::Transport("x".into()).is_connection_level());
        assert!(!GatewayError::Auth(AuthError::NotAuthenticated).is_connection_level());
    }
}
