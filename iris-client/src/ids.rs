//! Request identifier allocation.

use iris_protocol::RequestId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out connection-scoped request ids, starting at 1.
///
/// Ids are never reused for the lifetime of the allocator, so an id can never
/// collide with a slot that is still pending. Running out of the 64-bit space
/// is treated as a broken invariant.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next unused id.
    pub fn next(&self) -> RequestId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(id != u64::MAX, "request id space exhausted");
        RequestId(id)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
