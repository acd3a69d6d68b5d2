//! Per-connection protocol state machine.
//!
//! A [`ProtocolSession`] sits between a transport's byte stream and a
//! capability: inbound frames become capability invocations or response
//! deliveries, capability results become response frames appended to the
//! outbound sink. Requests and responses interleave freely in both
//! directions; the correlation id pairs them back up, so out-of-order
//! completion is expected and correct.
//!
//! All state here is exclusively owned by one connection and touched only
//! from the reactor thread, so interior mutability is `Rc<RefCell<_>>`
//! with no locking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::BytesMut;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::core::{Future, MessageIdPool, Step};
use crate::error::{Result, RpcError};
use crate::protocol::frame::{self, FrameCodec};
use crate::protocol::message::Message;

/// What a capability method produced.
pub enum Outcome {
    /// The result is available now.
    Ready(Value),
    /// The result depends on work that has not finished yet.
    Deferred(Future),
}

/// An addressable object exposing methods invokable by remote request.
///
/// Implementations match on the method name and answer unrecognized names
/// with [`RpcError::UnknownMethod`]; argument shape problems are
/// [`RpcError::BadArguments`]. Both are reported to the peer as an error
/// response instead of tearing the session down. A method may call back
/// into [`Peer::request`] to issue further calls over the same connection.
pub trait Capability {
    fn invoke(&mut self, method: &str, args: &[Value], peer: &Peer) -> Result<Outcome>;
}

/// State shared between the session and the [`Peer`] handles it hands out.
struct SessionCore {
    frames: FrameCodec,
    ids: MessageIdPool,
    pending: HashMap<u32, Future>,
    sink: Rc<RefCell<BytesMut>>,
}

impl SessionCore {
    fn send(&mut self, message: &Message) -> Result<()> {
        let framed = frame::pack(&message.encode()?)?;
        self.sink.borrow_mut().extend_from_slice(&framed);
        Ok(())
    }
}

/// Cheap handle a capability uses to issue outbound requests.
#[derive(Clone)]
pub struct Peer {
    core: Rc<RefCell<SessionCore>>,
}

impl Peer {
    /// Allocate an id, write a request frame, and return the future that
    /// its response will complete. Non-blocking.
    pub fn request(&self, method: &str, args: Vec<Value>) -> Result<Future> {
        let mut core = self.core.borrow_mut();
        let id = core.ids.get_id();
        let message = Message::Request {
            id,
            method: method.to_owned(),
            args,
        };
        if let Err(err) = core.send(&message) {
            // Nothing went on the wire; the id goes straight back.
            let _ = core.ids.return_id(id);
            return Err(err);
        }
        debug!(id, method, "outbound request");
        let future = Future::new();
        core.pending.insert(id, future.clone());
        Ok(future)
    }
}

/// Protocol dispatcher for one connection.
pub struct ProtocolSession {
    core: Rc<RefCell<SessionCore>>,
    capability: Rc<RefCell<dyn Capability>>,
}

impl ProtocolSession {
    /// Build a session writing its outbound frames into `sink`.
    ///
    /// The sink is shared with the transport that drains it; both run on
    /// the reactor thread.
    pub fn new(sink: Rc<RefCell<BytesMut>>, capability: impl Capability + 'static) -> Self {
        Self {
            core: Rc::new(RefCell::new(SessionCore {
                frames: FrameCodec::new(),
                ids: MessageIdPool::new(),
                pending: HashMap::new(),
                sink,
            })),
            capability: Rc::new(RefCell::new(capability)),
        }
    }

    /// Handle for issuing outbound requests on this connection.
    pub fn peer(&self) -> Peer {
        Peer {
            core: Rc::clone(&self.core),
        }
    }

    /// Issue an outbound request. See [`Peer::request`].
    pub fn request(&self, method: &str, args: Vec<Value>) -> Result<Future> {
        self.peer().request(method, args)
    }

    /// Feed bytes from the transport through the codec pair and route
    /// every completed message.
    ///
    /// A [`RpcError::Malformed`] return means the stream can no longer be
    /// trusted; the caller is expected to drop the connection.
    pub fn on_bytes(&mut self, data: &[u8]) -> Result<()> {
        let frames = self.core.borrow_mut().frames.receive(data);
        for payload in frames {
            match Message::decode(&payload)? {
                Message::Request { id, method, args } => {
                    self.handle_request(id, &method, &args)?
                }
                Message::Response { id, result } => self.handle_response(id, result)?,
            }
        }
        Ok(())
    }

    fn handle_request(&mut self, id: u32, method: &str, args: &[Value]) -> Result<()> {
        debug!(id, method, "inbound request");
        let peer = self.peer();
        let future = match self.capability.borrow_mut().invoke(method, args, &peer) {
            Ok(Outcome::Ready(value)) => Future::ready(value),
            Ok(Outcome::Deferred(future)) => future,
            Err(err @ (RpcError::UnknownMethod(_) | RpcError::BadArguments { .. })) => {
                // Surfaced to the peer; the session stays up.
                warn!(id, %err, "capability rejected request");
                return self.core.borrow_mut().send(&Message::Response {
                    id,
                    result: json!({ "error": err.to_string() }),
                });
            }
            Err(err) => return Err(err),
        };

        let core = Rc::clone(&self.core);
        future.and_then(move |result| {
            let response = Message::Response {
                id,
                result: result.clone(),
            };
            if let Err(err) = core.borrow_mut().send(&response) {
                error!(id, %err, "failed to write response");
            }
            Step::Done(result)
        });
        Ok(())
    }

    fn handle_response(&mut self, id: u32, result: Value) -> Result<()> {
        debug!(id, "inbound response");
        let future = self.core.borrow().pending.get(&id).cloned();
        let Some(future) = future else {
            // Peer protocol violation or a local bug; drop the message,
            // keep the session and the id pool untouched.
            warn!(id, "response with unknown correlation id dropped");
            return Ok(());
        };

        // Complete before releasing: a synchronous continuation may issue
        // a new outbound request and must not observe this id as free.
        future.complete(result)?;

        let mut core = self.core.borrow_mut();
        core.ids.return_id(id)?;
        core.pending.remove(&id);
        Ok(())
    }

    /// Cancel every request still in flight. Called when the connection
    /// closes so abandoned futures are observably cancelled rather than
    /// left pending forever.
    pub fn close(&mut self) {
        let pending: Vec<Future> = {
            let mut core = self.core.borrow_mut();
            core.pending.drain().map(|(_, future)| future).collect()
        };
        if !pending.is_empty() {
            warn!(count = pending.len(), "cancelling requests in flight at close");
        }
        for future in pending {
            future.cancel();
        }
    }

    /// Number of outbound requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.core.borrow().pending.len()
    }

    /// Number of correlation ids currently handed out.
    pub fn outstanding_ids(&self) -> usize {
        self.core.borrow().ids.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FutureState;

    /// Arithmetic fixture with an explicit unknown-method arm.
    struct Arith {
        // Deferred futures handed out by the `defer` method.
        parked: Rc<RefCell<Vec<Future>>>,
    }

    impl Arith {
        fn new() -> Self {
            Self {
                parked: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl Capability for Arith {
        fn invoke(&mut self, method: &str, args: &[Value], peer: &Peer) -> Result<Outcome> {
            let int = |i: usize| -> Result<i64> {
                args.get(i)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RpcError::BadArguments {
                        method: method.to_owned(),
                        reason: format!("argument {i} must be an integer"),
                    })
            };
            match method {
                "add" => Ok(Outcome::Ready(json!(int(0)? + int(1)?))),
                "echo" => Ok(Outcome::Ready(
                    args.first().cloned().unwrap_or(Value::Null),
                )),
                // Adds, then round-trips the sum through the peer's echo.
                "add_via_echo" => {
                    let sum = int(0)? + int(1)?;
                    Ok(Outcome::Deferred(peer.request("echo", vec![json!(sum)])?))
                }
                "defer" => {
                    let future = Future::new();
                    self.parked.borrow_mut().push(future.clone());
                    Ok(Outcome::Deferred(future))
                }
                _ => Err(RpcError::UnknownMethod(method.to_owned())),
            }
        }
    }

    fn session() -> (ProtocolSession, Rc<RefCell<BytesMut>>, Rc<RefCell<Vec<Future>>>) {
        let sink = Rc::new(RefCell::new(BytesMut::new()));
        let capability = Arith::new();
        let parked = Rc::clone(&capability.parked);
        let session = ProtocolSession::new(Rc::clone(&sink), capability);
        (session, sink, parked)
    }

    /// Decode every message currently in the sink, draining it.
    fn drain(sink: &Rc<RefCell<BytesMut>>) -> Vec<Message> {
        let bytes = sink.borrow_mut().split().freeze();
        let mut codec = FrameCodec::new();
        codec
            .receive(&bytes)
            .iter()
            .map(|frame| Message::decode(frame).unwrap())
            .collect()
    }

    fn framed(message: &Message) -> Vec<u8> {
        frame::pack(&message.encode().unwrap()).unwrap()
    }

    #[test]
    fn request_is_invoked_and_answered() {
        let (mut session, sink, _) = session();
        session
            .on_bytes(&framed(&Message::Request {
                id: 1,
                method: "add".into(),
                args: vec![json!(1), json!(2)],
            }))
            .unwrap();
        assert_eq!(
            drain(&sink),
            vec![Message::Response { id: 1, result: json!(3) }]
        );
    }

    #[test]
    fn unknown_method_becomes_an_error_response() {
        let (mut session, sink, _) = session();
        session
            .on_bytes(&framed(&Message::Request {
                id: 5,
                method: "frobnicate".into(),
                args: vec![],
            }))
            .unwrap();
        let replies = drain(&sink);
        let Message::Response { id, result } = &replies[0] else {
            panic!("expected a response, got {replies:?}");
        };
        assert_eq!(*id, 5);
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("unknown method: frobnicate"));
    }

    #[test]
    fn bad_arguments_become_an_error_response() {
        let (mut session, sink, _) = session();
        session
            .on_bytes(&framed(&Message::Request {
                id: 3,
                method: "add".into(),
                args: vec![json!("one"), json!(2)],
            }))
            .unwrap();
        let replies = drain(&sink);
        let Message::Response { id: 3, result } = &replies[0] else {
            panic!("expected an error response, got {replies:?}");
        };
        assert!(result["error"].as_str().unwrap().contains("bad arguments"));
    }

    #[test]
    fn deferred_result_is_written_when_it_completes() {
        let (mut session, sink, parked) = session();
        session
            .on_bytes(&framed(&Message::Request {
                id: 9,
                method: "defer".into(),
                args: vec![],
            }))
            .unwrap();
        // Nothing to answer with yet.
        assert!(drain(&sink).is_empty());

        let future = parked.borrow_mut().pop().unwrap();
        future.complete(json!("later")).unwrap();
        assert_eq!(
            drain(&sink),
            vec![Message::Response { id: 9, result: json!("later") }]
        );
    }

    #[test]
    fn outbound_request_registers_a_pending_future() {
        let (session, sink, _) = session();
        let future = session.request("add", vec![json!(1), json!(2)]).unwrap();
        assert_eq!(future.state(), FutureState::Pending);
        assert_eq!(session.pending_requests(), 1);
        assert_eq!(
            drain(&sink),
            vec![Message::Request {
                id: 1,
                method: "add".into(),
                args: vec![json!(1), json!(2)],
            }]
        );
    }

    #[test]
    fn response_completes_the_pending_future_and_recycles_the_id() {
        let (mut session, _sink, _) = session();
        let future = session.request("echo", vec![json!("hi")]).unwrap();
        session
            .on_bytes(&framed(&Message::Response { id: 1, result: json!("hi") }))
            .unwrap();
        assert_eq!(future.result(), Some(json!("hi")));
        assert_eq!(session.pending_requests(), 0);
        assert_eq!(session.outstanding_ids(), 0);
        // The released id is available to the next request.
        session.request("echo", vec![]).unwrap();
        assert_eq!(session.outstanding_ids(), 1);
    }

    #[test]
    fn unknown_response_id_is_dropped_without_side_effects() {
        let (mut session, sink, _) = session();
        session
            .on_bytes(&framed(&Message::Response { id: 42, result: json!(0) }))
            .unwrap();
        assert!(drain(&sink).is_empty());
        assert_eq!(session.outstanding_ids(), 0);
        // The pool was not touched: the next id is still 1.
        session.request("echo", vec![]).unwrap();
        assert_eq!(
            drain(&sink),
            vec![Message::Request { id: 1, method: "echo".into(), args: vec![] }]
        );
    }

    #[test]
    fn malformed_payload_is_a_session_error() {
        let (mut session, _sink, _) = session();
        let framed = frame::pack(b"{nonsense").unwrap();
        assert!(matches!(
            session.on_bytes(&framed),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn close_cancels_requests_in_flight() {
        let (mut session, _sink, _) = session();
        let future = session.request("echo", vec![]).unwrap();
        session.close();
        assert_eq!(future.state(), FutureState::Cancelled);
        assert_eq!(session.pending_requests(), 0);
    }

    /// Messages split across reads and concatenated in one read both route.
    #[test]
    fn fragmented_and_batched_delivery() {
        let (mut session, sink, _) = session();
        let a = framed(&Message::Request { id: 1, method: "echo".into(), args: vec![json!(1)] });
        let b = framed(&Message::Request { id: 2, method: "echo".into(), args: vec![json!(2)] });
        let mut joined = a;
        joined.extend_from_slice(&b);

        let (head, tail) = joined.split_at(3);
        session.on_bytes(head).unwrap();
        session.on_bytes(tail).unwrap();

        assert_eq!(
            drain(&sink),
            vec![
                Message::Response { id: 1, result: json!(1) },
                Message::Response { id: 2, result: json!(2) },
            ]
        );
    }
}
