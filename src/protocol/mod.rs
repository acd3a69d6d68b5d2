//! Protocol layer: framing, message codec, and per-connection dispatch.
//!
//! Layering, bottom up:
//! - [`frame`]: length-delimited byte frames, payload-agnostic
//! - [`message`]: JSON payloads to and from typed [`Message`] values
//! - [`session`]: routes decoded messages to a capability or a pending
//!   future and writes results back out

pub mod frame;
mod message;
mod session;

pub use frame::{FrameCodec, HEADER_LEN, MAX_PAYLOAD};
pub use message::Message;
pub use session::{Capability, Outcome, Peer, ProtocolSession};
