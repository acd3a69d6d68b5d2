//! One established connection, driven by the reactor.
//!
//! Reads are non-blocking and chunked; every chunk is fed straight into
//! the session. Writes drain the outbound buffer the session appends to.
//! The buffer is shared between the two through `Rc<RefCell<_>>`: both
//! sides run on the single reactor thread, so program order is the only
//! synchronization needed.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use tracing::{info, warn};

use crate::network::reactor::{EventSource, ReactorCtx};
use crate::protocol::{Capability, ProtocolSession};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// A connected peer: socket, outbound buffer, and its protocol session.
pub struct Connection {
    stream: TcpStream,
    outbound: Rc<RefCell<BytesMut>>,
    session: ProtocolSession,
}

impl Connection {
    /// Wrap an accepted or connected non-blocking stream.
    pub fn new(stream: TcpStream, capability: impl Capability + 'static) -> io::Result<Self> {
        // Frames are small; don't let Nagle sit on them.
        stream.set_nodelay(true)?;
        let outbound = Rc::new(RefCell::new(BytesMut::with_capacity(16 * 1024)));
        let session = ProtocolSession::new(Rc::clone(&outbound), capability);
        Ok(Self {
            stream,
            outbound,
            session,
        })
    }

    /// The session driving this connection, e.g. to issue outbound
    /// requests before the first inbound byte arrives.
    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    fn closed_by_peer(&mut self, ctx: &mut ReactorCtx) {
        info!("peer closed connection");
        self.session.close();
        ctx.close_current();
    }
}

impl EventSource for Connection {
    fn registry_source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        !self.outbound.borrow().is_empty()
    }

    fn on_readable(&mut self, ctx: &mut ReactorCtx) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                // Zero bytes read: graceful closure, not an error.
                Ok(0) => {
                    self.closed_by_peer(ctx);
                    return Ok(());
                }
                Ok(n) => {
                    if let Err(err) = self.session.on_bytes(&chunk[..n]) {
                        // Connection-local: drop this peer, keep the
                        // reactor and every other connection running.
                        warn!(%err, "protocol error, dropping connection");
                        self.session.close();
                        ctx.close_current();
                        return Ok(());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "read failed, dropping connection");
                    self.session.close();
                    ctx.close_current();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn on_writable(&mut self, ctx: &mut ReactorCtx) -> io::Result<()> {
        loop {
            let written = {
                let outbound = self.outbound.borrow();
                if outbound.is_empty() {
                    return Ok(());
                }
                match self.stream.write(&outbound[..]) {
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        drop(outbound);
                        warn!(%err, "write failed, dropping connection");
                        self.session.close();
                        ctx.close_current();
                        return Ok(());
                    }
                }
            };
            self.outbound.borrow_mut().advance(written);
        }
    }

    fn shutdown(&mut self) {
        // Dropping the stream closes the socket; pending requests were
        // already cancelled by whoever initiated the close.
        self.session.close();
    }
}
