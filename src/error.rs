//! Error taxonomy for the RPC core.
//!
//! Codec and id-pool errors are local to one connection and are handled by
//! closing that connection; only a failure of the readiness poll itself is
//! fatal to the whole reactor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// Outbound payload does not fit in the fixed-width length header.
    #[error("frame payload of {0} bytes exceeds the {} byte limit", crate::protocol::MAX_PAYLOAD)]
    FrameTooLarge(usize),

    /// Inbound payload is not a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The capability exposes no method with the requested name.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The capability rejected the argument list shape.
    #[error("bad arguments for {method}: {reason}")]
    BadArguments { method: String, reason: String },

    /// A response arrived whose id matches no outstanding request.
    #[error("no pending request for response id {0}")]
    UnknownResponseId(u32),

    /// A future was completed twice.
    #[error("future already completed")]
    DoubleCompletion,

    /// A message id was released twice.
    #[error("message id {0} already released")]
    DuplicateRelease(u32),

    /// The connection closed with the request still in flight.
    #[error("connection closed with request in flight")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
