//! Process-wide transmit buffer pool.
//!
//! Segment payloads, FEC shards and staged datagrams all borrow from one
//! recyclable pool of `MTU_LIMIT`-capacity buffers. An acquisition must be
//! matched by exactly one release; the accounting counters below let tests
//! assert that a quiescent transport has returned everything it took.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::MTU_LIMIT;

static FREE: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
static ACQUIRED: AtomicU64 = AtomicU64::new(0);
static RELEASED: AtomicU64 = AtomicU64::new(0);

/// Take a buffer from the pool, allocating when the pool is empty.
///
/// The buffer comes back zero-length with capacity [`MTU_LIMIT`].
pub fn get() -> Vec<u8> {
    ACQUIRED.fetch_add(1, Ordering::Relaxed);
    let recycled = FREE.lock().pop();
    match recycled {
        Some(mut buf) => {
            buf.clear();
            buf
        }
        None => Vec::with_capacity(MTU_LIMIT),
    }
}

/// Return a buffer to the pool.
///
/// Buffers that did not originate in the pool (capacity below
/// [`MTU_LIMIT`]) are dropped instead of recycled.
pub fn put(buf: Vec<u8>) {
    RELEASED.fetch_add(1, Ordering::Relaxed);
    if buf.capacity() >= MTU_LIMIT {
        FREE.lock().push(buf);
    }
}

/// Number of idle buffers currently held by the pool.
pub fn available() -> usize {
    FREE.lock().len()
}

/// Number of buffers acquired and not yet released.
pub fn outstanding() -> u64 {
    // Relaxed reads may transiently disagree under concurrent traffic; at
    // quiescence the difference is exact.
    ACQUIRED
        .load(Ordering::Relaxed)
        .saturating_sub(RELEASED.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_recycles() {
        let before = available();
        let buf = get();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= MTU_LIMIT);
        put(buf);
        assert!(available() >= before);
    }

    #[test]
    fn foreign_buffers_are_not_recycled() {
        let before = available();
        put(vec![0u8; 16]);
        assert_eq!(available(), before);
    }
}
