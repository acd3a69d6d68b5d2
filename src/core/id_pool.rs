//! Correlation id allocation.
//!
//! Ids are small positive integers scoped to one connection. An id handed
//! out by [`MessageIdPool::get_id`] stays reserved until it is released, so
//! two in-flight requests can never share a correlation id.

use std::collections::HashSet;

use crate::error::{Result, RpcError};

/// Allocator that recycles released ids before growing the counter.
///
/// Id 0 is never issued; it is reserved as the "no id" sentinel.
#[derive(Debug)]
pub struct MessageIdPool {
    next_id: u32,
    released: HashSet<u32>,
}

impl MessageIdPool {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            released: HashSet::new(),
        }
    }

    /// Hand out an id, preferring a previously released one.
    ///
    /// No ordering is guaranteed among recycled ids.
    pub fn get_id(&mut self) -> u32 {
        if let Some(&id) = self.released.iter().next() {
            self.released.remove(&id);
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Release an id so a later `get_id` may reuse it.
    pub fn return_id(&mut self, id: u32) -> Result<()> {
        if !self.released.insert(id) {
            return Err(RpcError::DuplicateRelease(id));
        }
        Ok(())
    }

    /// Number of ids currently handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        (self.next_id as usize - 1) - self.released.len()
    }
}

impl Default for MessageIdPool {
    fn default() -> Self {
        Self::new()
    }
}
