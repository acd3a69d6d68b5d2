//! Readiness-driven event loop.
//!
//! The reactor multiplexes many connection-like sources on one thread via
//! mio (epoll/kqueue). It owns no protocol knowledge: sources declare what
//! they want through [`EventSource`] and the reactor calls them back when
//! the OS reports readiness.
//!
//! Sources never see the registry itself; structural changes (accepting a
//! connection, closing one) go through the [`ReactorCtx`] passed into each
//! callback and are applied after the dispatch pass.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::{info, warn};

use crate::error::Result;

const EVENTS_CAPACITY: usize = 1024;

/// Contract between the reactor and anything it multiplexes: connections,
/// listening sockets, and so on.
pub trait EventSource {
    /// The mio handle the reactor registers for readiness.
    fn registry_source(&mut self) -> &mut dyn Source;

    /// Sign up for read readiness this iteration?
    fn wants_read(&self) -> bool;

    /// Sign up for write readiness this iteration?
    fn wants_write(&self) -> bool;

    /// Called when the source can read without blocking. An `Err` is
    /// treated as unrecoverable for the whole reactor; per-connection
    /// problems are handled by closing the source via `ctx` instead.
    fn on_readable(&mut self, ctx: &mut ReactorCtx) -> io::Result<()>;

    /// Called when the source can write without blocking.
    fn on_writable(&mut self, ctx: &mut ReactorCtx) -> io::Result<()>;

    /// Release the underlying resource. Called exactly once, when the
    /// source leaves the registry.
    fn shutdown(&mut self);
}

/// Deferred registry operations collected during one dispatch pass.
pub struct ReactorCtx {
    current: Token,
    spawned: Vec<Box<dyn EventSource>>,
    closing: HashSet<Token>,
}

impl ReactorCtx {
    fn new() -> Self {
        Self {
            current: Token(0),
            spawned: Vec::new(),
            closing: HashSet::new(),
        }
    }

    /// Register a new source once this dispatch pass finishes.
    pub fn spawn(&mut self, source: Box<dyn EventSource>) {
        self.spawned.push(source);
    }

    /// Deregister and shut down the source being dispatched.
    pub fn close_current(&mut self) {
        self.closing.insert(self.current);
    }
}

/// Cloneable signal that makes [`Reactor::run`] return after the current
/// iteration. Safe to fire from another thread.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct Entry {
    source: Box<dyn EventSource>,
    /// Interest currently registered with the poll, if any.
    registered: Option<Interest>,
}

/// Event loop multiplexing many sources on one thread.
pub struct Reactor {
    poll: Poll,
    sources: HashMap<Token, Entry>,
    next_token: usize,
    idle: Duration,
    stopped: Arc<AtomicBool>,
}

impl Reactor {
    /// `idle` bounds both the poll timeout and the sleep taken when no
    /// source wants I/O (polling on empty interest sets is avoided).
    pub fn new(idle: Duration) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            sources: HashMap::new(),
            next_token: 0,
            idle,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stopped))
    }

    /// Add a source to the registry.
    pub fn register(&mut self, mut source: Box<dyn EventSource>) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = current_interest(source.as_ref());
        if let Some(interest) = interest {
            self.poll
                .registry()
                .register(source.registry_source(), token, interest)?;
        }
        self.sources.insert(
            token,
            Entry {
                source,
                registered: interest,
            },
        );
        Ok(token)
    }

    /// Remove a source from the registry and shut it down.
    pub fn deregister(&mut self, token: Token) {
        if let Some(mut entry) = self.sources.remove(&token) {
            if entry.registered.is_some() {
                let _ = self
                    .poll
                    .registry()
                    .deregister(entry.source.registry_source());
            }
            entry.source.shutdown();
            info!(token = token.0, "source deregistered");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Run until the registry drains or the stop handle fires.
    ///
    /// A long-lived server simply keeps its listener registered, which
    /// makes this loop run indefinitely. If the readiness poll itself
    /// fails, every registered source is closed before the error
    /// propagates; partial cleanup is not acceptable.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.sources.is_empty() && !self.stopped.load(Ordering::Relaxed) {
            let any_interest = match self.refresh_interest() {
                Ok(any) => any,
                Err(err) => {
                    self.close_all();
                    return Err(err.into());
                }
            };
            if !any_interest {
                std::thread::sleep(self.idle);
                continue;
            }

            if let Err(err) = self.poll.poll(&mut events, Some(self.idle)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.close_all();
                return Err(err.into());
            }

            let mut ctx = ReactorCtx::new();
            for event in events.iter() {
                let token = event.token();
                if ctx.closing.contains(&token) {
                    continue;
                }
                ctx.current = token;

                if event.is_readable() {
                    if let Some(entry) = self.sources.get_mut(&token) {
                        if entry.source.wants_read() {
                            if let Err(err) = entry.source.on_readable(&mut ctx) {
                                self.close_all();
                                return Err(err.into());
                            }
                        }
                    }
                }
                // The read handler may have closed its own source.
                if ctx.closing.contains(&token) {
                    continue;
                }
                if event.is_writable() {
                    if let Some(entry) = self.sources.get_mut(&token) {
                        if entry.source.wants_write() {
                            if let Err(err) = entry.source.on_writable(&mut ctx) {
                                self.close_all();
                                return Err(err.into());
                            }
                        }
                    }
                }
            }
            self.apply(ctx);
        }

        info!("reactor exiting");
        Ok(())
    }

    /// Re-sync each source's registered interest with what it currently
    /// wants. Returns whether any source wants I/O at all.
    fn refresh_interest(&mut self) -> io::Result<bool> {
        let mut any = false;
        let registry = self.poll.registry();
        for (token, entry) in self.sources.iter_mut() {
            let wanted = current_interest(entry.source.as_ref());
            any |= wanted.is_some();
            if wanted == entry.registered {
                continue;
            }
            match (entry.registered, wanted) {
                (Some(_), Some(interest)) => {
                    registry.reregister(entry.source.registry_source(), *token, interest)?
                }
                (None, Some(interest)) => {
                    registry.register(entry.source.registry_source(), *token, interest)?
                }
                (Some(_), None) => registry.deregister(entry.source.registry_source())?,
                (None, None) => {}
            }
            entry.registered = wanted;
        }
        Ok(any)
    }

    fn apply(&mut self, ctx: ReactorCtx) {
        for token in ctx.closing {
            self.deregister(token);
        }
        for source in ctx.spawned {
            if let Err(err) = self.register(source) {
                warn!(%err, "failed to register spawned source, dropping it");
            }
        }
    }

    /// Best-effort teardown of every registered source.
    fn close_all(&mut self) {
        for (_, mut entry) in self.sources.drain() {
            if entry.registered.is_some() {
                let _ = self
                    .poll
                    .registry()
                    .deregister(entry.source.registry_source());
            }
            entry.source.shutdown();
        }
        warn!("reactor closed all sources");
    }
}

fn current_interest(source: &dyn EventSource) -> Option<Interest> {
    match (source.wants_read(), source.wants_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_returns_immediately() {
        let mut reactor = Reactor::new(Duration::from_millis(1)).unwrap();
        reactor.run().unwrap();
    }

    #[test]
    fn stop_handle_breaks_the_loop() {
        struct Quiet(mio::net::TcpListener);
        impl EventSource for Quiet {
            fn registry_source(&mut self) -> &mut dyn Source {
                &mut self.0
            }
            fn wants_read(&self) -> bool {
                true
            }
            fn wants_write(&self) -> bool {
                false
            }
            fn on_readable(&mut self, _ctx: &mut ReactorCtx) -> io::Result<()> {
                Ok(())
            }
            fn on_writable(&mut self, _ctx: &mut ReactorCtx) -> io::Result<()> {
                Ok(())
            }
            fn shutdown(&mut self) {}
        }

        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut reactor = Reactor::new(Duration::from_millis(1)).unwrap();
        reactor.register(Box::new(Quiet(listener))).unwrap();

        let stop = reactor.stop_handle();
        stop.stop();
        // The source never becomes ready; only the stop flag ends the run.
        reactor.run().unwrap();
        assert!(!reactor.is_empty());
    }

    #[test]
    fn deregistering_the_last_source_drains_the_registry() {
        struct Nop(mio::net::TcpListener);
        impl EventSource for Nop {
            fn registry_source(&mut self) -> &mut dyn Source {
                &mut self.0
            }
            fn wants_read(&self) -> bool {
                false
            }
            fn wants_write(&self) -> bool {
                false
            }
            fn on_readable(&mut self, _ctx: &mut ReactorCtx) -> io::Result<()> {
                Ok(())
            }
            fn on_writable(&mut self, _ctx: &mut ReactorCtx) -> io::Result<()> {
                Ok(())
            }
            fn shutdown(&mut self) {}
        }

        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut reactor = Reactor::new(Duration::from_millis(1)).unwrap();
        let token = reactor.register(Box::new(Nop(listener))).unwrap();
        assert!(!reactor.is_empty());
        reactor.deregister(token);
        assert!(reactor.is_empty());
    }
}
