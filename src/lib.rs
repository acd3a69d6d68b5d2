//! iris - minimal bidirectional RPC over a readiness-driven reactor
//!
//! Architecture:
//! - Length-prefixed framing: 2-byte big-endian header, opaque payload
//! - JSON messages: requests and responses correlated by sign-negated ids
//! - Single-assignment futures: handlers suspend by returning one
//! - Reactor: non-blocking I/O multiplexed with mio, one thread, no runtime
//!
//! Either end of a connection can call the other: a capability handling a
//! request may itself issue requests back over the same connection and
//! complete its response only once those resolve.
//!
//! ```no_run
//! use std::time::Duration;
//! use iris::{Capability, Connection, Listener, Outcome, Peer, Reactor, RpcError};
//! use serde_json::{json, Value};
//!
//! struct Adder;
//!
//! impl Capability for Adder {
//!     fn invoke(&mut self, method: &str, args: &[Value], _peer: &Peer)
//!         -> iris::Result<Outcome>
//!     {
//!         match method {
//!             "add" => {
//!                 let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
//!                 Ok(Outcome::Ready(json!(sum)))
//!             }
//!             _ => Err(RpcError::UnknownMethod(method.to_owned())),
//!         }
//!     }
//! }
//!
//! fn main() -> iris::Result<()> {
//!     let mut reactor = Reactor::new(Duration::from_millis(50))?;
//!     let listener = Listener::bind(
//!         "127.0.0.1:9999".parse().unwrap(),
//!         Box::new(|stream, _peer| Ok(Box::new(Connection::new(stream, Adder)?) as _)),
//!     )?;
//!     reactor.register(Box::new(listener))?;
//!     reactor.run()
//! }
//! ```

pub mod core;
mod error;
pub mod network;
pub mod protocol;

pub use crate::core::{Future, FutureState, MessageIdPool, Step};
pub use crate::error::{Result, RpcError};
pub use crate::network::{Connection, EventSource, Listener, Reactor, ReactorCtx, StopHandle};
pub use crate::protocol::{Capability, FrameCodec, Message, Outcome, Peer, ProtocolSession};
