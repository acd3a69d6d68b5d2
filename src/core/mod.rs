//! Core module: single-threaded concurrency primitives.
//!
//! Design principles:
//! - No blocking: handlers suspend by returning a pending [`Future`]
//! - No threads: continuations run inside one reactor iteration
//! - Exactly-once: results and correlation ids are single-assignment

mod future;
mod id_pool;

pub use future::{Future, FutureState, Step};
pub use id_pool::MessageIdPool;
