//! Accepting source: turns incoming connections into reactor sources.

use std::io;
use std::net::SocketAddr;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::network::reactor::{EventSource, ReactorCtx};

/// Builds one connection source per accepted peer.
pub type SessionFactory = Box<dyn FnMut(TcpStream, SocketAddr) -> io::Result<Box<dyn EventSource>>>;

/// A listening socket registered with the reactor.
///
/// "Readable" here means "a connection is pending": the read handler
/// accepts it, asks the factory for a source, and spawns that source into
/// the registry. A listener never writes.
pub struct Listener {
    listener: TcpListener,
    factory: SessionFactory,
}

impl Listener {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr, factory: SessionFactory) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(%addr, "listening");
        Ok(Self { listener, factory })
    }

    /// The locally bound address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl EventSource for Listener {
    fn registry_source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn on_readable(&mut self, ctx: &mut ReactorCtx) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "connection accepted");
                    ctx.spawn((self.factory)(stream, peer)?);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn on_writable(&mut self, _ctx: &mut ReactorCtx) -> io::Result<()> {
        debug_assert!(false, "listener never registers write interest");
        Ok(())
    }

    fn shutdown(&mut self) {
        // Dropping the listener closes the socket.
    }
}
