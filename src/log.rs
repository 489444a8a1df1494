//! Diagnostics queue for conditions that must not occur in correct operation.
//!
//! Messages are queued from ISR context without blocking and drained by the
//! main loop to whatever transport the host program uses. When the queue is
//! full the message is dropped and counted.

use core::sync::atomic::{AtomicU32, Ordering};
use heapless::{mpmc::Q8, String};

pub const DIAG_MSG_SZ: usize = 64;

static DIAGQ: Q8<String<DIAG_MSG_SZ>> = Q8::new();
static DROPPED: AtomicU32 = AtomicU32::new(0);

pub fn log(msg: &str) {
    debug!("diag: {}", msg);

    let mut s: String<DIAG_MSG_SZ> = String::new();
    if s.push_str(msg).is_err() || DIAGQ.enqueue(s).is_err() {
        DROPPED.fetch_add(1, Ordering::Relaxed);
    }
}

/// Oldest queued message, if any. Called from the main loop.
pub fn drain() -> Option<String<DIAG_MSG_SZ>> {
    DIAGQ.dequeue()
}

/// Number of messages dropped on a full queue.
pub fn dropped() -> u32 {
    DROPPED.load(Ordering::Relaxed)
}
