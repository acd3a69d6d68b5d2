//! Network layer: readiness-driven non-blocking I/O.
//!
//! Built on mio (epoll/kqueue behind one portable poll). The [`Reactor`]
//! drives everything; [`Listener`] and [`Connection`] are the two source
//! kinds the protocol needs. No socket operation here blocks.

mod connection;
mod listener;
mod reactor;

pub use connection::Connection;
pub use listener::{Listener, SessionFactory};
pub use reactor::{EventSource, Reactor, ReactorCtx, StopHandle};
