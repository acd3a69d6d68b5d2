//! Message codec: JSON payloads to and from typed messages.
//!
//! One frame carries exactly one message. On the wire a message is an
//! untyped JSON object disambiguated by the sign of `id`:
//!
//! - request:  `{"id": n > 0, "method": "...", "args": [...]}`
//! - response: `{"id": n < 0, "result": ...}` where `-n` is the request id
//!
//! Decoded values are a closed enum and always carry the positive
//! correlation id; the sign convention lives only at this boundary.
//! Anything that does not fit is rejected at decode time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// A decoded protocol message. Immutable after decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u32,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u32,
        result: Value,
    },
}

/// Flat wire shape shared by both directions.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

impl Message {
    /// Decode one frame payload. Stateless.
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let wire: WireMessage = serde_json::from_slice(payload)?;
        match wire.id {
            0 => Err(RpcError::Malformed("id 0 is reserved".into())),
            id if id > 0 => {
                let id = u32::try_from(id)
                    .map_err(|_| RpcError::Malformed(format!("request id {id} out of range")))?;
                let method = wire
                    .method
                    .ok_or_else(|| RpcError::Malformed("request without method".into()))?;
                let args = match wire.args {
                    Some(Value::Array(items)) => items,
                    // A scalar argument is a one-element sequence.
                    Some(other) => vec![other],
                    None => return Err(RpcError::Malformed("request without args".into())),
                };
                Ok(Message::Request { id, method, args })
            }
            id => {
                let id = u32::try_from(id.unsigned_abs())
                    .map_err(|_| RpcError::Malformed(format!("response id {id} out of range")))?;
                let result = wire
                    .result
                    .ok_or_else(|| RpcError::Malformed("response without result".into()))?;
                Ok(Message::Response { id, result })
            }
        }
    }

    /// Encode into one frame payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = match self {
            Message::Request { id, method, args } => WireMessage {
                id: i64::from(*id),
                method: Some(method.clone()),
                args: Some(Value::Array(args.clone())),
                result: None,
            },
            Message::Response { id, result } => WireMessage {
                id: -i64::from(*id),
                method: None,
                args: None,
                result: Some(result.clone()),
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// The correlation id linking a request to its response.
    pub fn correlation_id(&self) -> u32 {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => *id,
        }
    }
}
