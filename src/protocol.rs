// ===============================
// src/protocol.rs
// ===============================
//
// JSON-RPC 2.0 envelope used by the venue:
//   request : {"jsonrpc":"2.0","id":<int>,"method":<str>,"params":<obj>}
//   reply   : {"id":<int>,"result":<any>} | {"id":<int>,"error":{code,message}}
//   push    : {"method":"subscription","params":{"channel":<str>,"data":<any>}}
//   beat    : {"method":"heartbeat","params":{"type":"heartbeat"|"test_request"}}
//
// Reply vs push is decided by the presence of `id` only.
//
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, RpcError};

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self { jsonrpc: "2.0", id, method, params }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Encoded frame on its way to the venue, tagged with the connection it was
/// written for. Session 0 is untagged and goes out on whatever socket is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub session: u64,
    pub text: String,
}

impl OutboundFrame {
    pub fn new(session: u64, text: impl Into<String>) -> Self {
        Self { session, text: text.into() }
    }

    /// False when the frame was written for an earlier connection.
    pub fn belongs_to(&self, session: u64) -> bool {
        self.session == 0 || self.session == session
    }
}

impl std::ops::Deref for OutboundFrame {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl From<String> for OutboundFrame {
    fn from(text: String) -> Self {
        Self::new(0, text)
    }
}

impl From<&str> for OutboundFrame {
    fn from(text: &str) -> Self {
        Self::new(0, text)
    }
}

/// Channel push, already unwrapped from the envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatKind {
    Heartbeat,
    TestRequest,
}

/// Every inbound frame lands in exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply { id: u64, outcome: Result<Value, RpcError> },
    Push(PushEvent),
    Heartbeat(HeartbeatKind),
}

pub fn parse_frame(text: &str) -> Result<Inbound, ProtocolError> {
    let v: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = v
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("frame is not a JSON object".into()))?;

    match obj.get("id") {
        Some(Value::Null) | None => {}
        Some(id) => {
            let id = id
                .as_u64()
                .ok_or_else(|| ProtocolError::Malformed(format!("non-integer id {id}")))?;
            if let Some(err) = obj.get("error") {
                let err: RpcError = serde_json::from_value(err.clone())
                    .map_err(|e| ProtocolError::Malformed(format!("error object: {e}")))?;
                return Ok(Inbound::Reply { id, outcome: Err(err) });
            }
            if let Some(result) = obj.get("result") {
                return Ok(Inbound::Reply { id, outcome: Ok(result.clone()) });
            }
            return Err(ProtocolError::Unrecognized(format!(
                "reply {id} has neither result nor error"
            )));
        }
    }

    let method = obj.get("method").and_then(Value::as_str);
    let params = obj.get("params");
    match method {
        Some("heartbeat") => {
            let kind = params
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("heartbeat");
            Ok(Inbound::Heartbeat(if kind == "test_request" {
                HeartbeatKind::TestRequest
            } else {
                HeartbeatKind::Heartbeat
            }))
        }
        Some("subscription") => {
            let params = params.ok_or(ProtocolError::MissingField("params"))?;
            let channel = params
                .get("channel")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("params.channel"))?;
            Ok(Inbound::Push(PushEvent {
                channel: channel.to_string(),
                data: params.get("data").cloned().unwrap_or(Value::Null),
            }))
        }
        Some(other) => Err(ProtocolError::Unrecognized(format!("method `{other}` without id"))),
        None => Err(ProtocolError::Unrecognized("no id and no method".into())),
    }
}
