//! Single-assignment result cell with callback chaining.
//!
//! The concurrency primitive used instead of blocking calls: a handler
//! either produces a value immediately or returns a pending [`Future`],
//! and continuations attach via [`Future::and_then`]. Everything runs on
//! the one reactor thread, so the cell is `Rc<RefCell<_>>`-backed and
//! handles are cheap clones.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{Result, RpcError};

/// What a continuation produced: a concrete value, or another future the
/// rest of the chain must wait on.
pub enum Step {
    Done(Value),
    Wait(Future),
}

type Chain = Box<dyn FnOnce(Value) -> Step>;

/// Observable lifecycle of a [`Future`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Ready,
    /// The owning connection closed before a result arrived.
    Cancelled,
}

enum State {
    Pending,
    Ready(Value),
    Cancelled,
}

struct Inner {
    state: State,
    callbacks: VecDeque<Chain>,
}

/// Cloneable handle to a single-assignment asynchronous result.
#[derive(Clone)]
pub struct Future {
    inner: Rc<RefCell<Inner>>,
}

impl Future {
    /// A future with no result yet.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                callbacks: VecDeque::new(),
            })),
        }
    }

    /// A future that already holds its result.
    ///
    /// This is the bridge that lets handlers return either an immediate
    /// value or a pending future through one code path.
    pub fn ready(value: Value) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Ready(value),
                callbacks: VecDeque::new(),
            })),
        }
    }

    pub fn state(&self) -> FutureState {
        match self.inner.borrow().state {
            State::Pending => FutureState::Pending,
            State::Ready(_) => FutureState::Ready,
            State::Cancelled => FutureState::Cancelled,
        }
    }

    /// Current result, if any.
    pub fn result(&self) -> Option<Value> {
        match &self.inner.borrow().state {
            State::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Attach a continuation.
    ///
    /// If the future is still pending the continuation is queued. If it is
    /// already ready the continuation runs synchronously, before this call
    /// returns, against the stored result (and its return value replaces
    /// that result). Continuations attached to a cancelled future are
    /// dropped.
    pub fn and_then<F>(&self, f: F)
    where
        F: FnOnce(Value) -> Step + 'static,
    {
        let resume = {
            let mut inner = self.inner.borrow_mut();
            match &inner.state {
                State::Pending => {
                    inner.callbacks.push_back(Box::new(f));
                    None
                }
                State::Ready(value) => {
                    let value = value.clone();
                    inner.callbacks.push_back(Box::new(f));
                    Some(value)
                }
                State::Cancelled => None,
            }
        };
        if let Some(value) = resume {
            self.run_chain(value);
        }
    }

    /// Store the result and run the continuation chain.
    ///
    /// A future may be completed exactly once.
    pub fn complete(&self, value: Value) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return Err(RpcError::DoubleCompletion);
            }
            inner.state = State::Ready(value.clone());
        }
        self.run_chain(value);
        Ok(())
    }

    /// Abandon a pending future, dropping its queued continuations.
    ///
    /// Completing a cancelled future is a [`RpcError::DoubleCompletion`].
    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Pending) {
            inner.state = State::Cancelled;
            inner.callbacks.clear();
        }
    }

    /// Drain the continuation queue, threading the result through it.
    ///
    /// When a continuation hands back [`Step::Wait`], the remainder of this
    /// queue is parked as a continuation on the inner future, so a chain of
    /// any depth resolves without recursing per link.
    fn run_chain(&self, mut value: Value) -> Value {
        loop {
            let cb = {
                let mut inner = self.inner.borrow_mut();
                inner.state = State::Ready(value.clone());
                match inner.callbacks.pop_front() {
                    Some(cb) => cb,
                    None => return value,
                }
            };
            match cb(value.clone()) {
                Step::Done(next) => value = next,
                Step::Wait(pending) => {
                    let outer = self.clone();
                    pending.and_then(move |inner_value| Step::Done(outer.run_chain(inner_value)));
                    return value;
                }
            }
        }
    }

    #[cfg(test)]
    fn queued_callbacks(&self) -> usize {
        self.inner.borrow().callbacks.len()
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}
