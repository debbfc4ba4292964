//! Monotonic timestamp source for on-disk file names.
//!
//! WAL files are named after a millisecond timestamp and SSTable files after
//! a nanosecond timestamp. Under coarse clock resolution (or repeated flushes
//! within one tick) two files could otherwise collide on the same name, so
//! every caller gets a value strictly greater than any previously handed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MS: AtomicU64 = AtomicU64::new(0);
static LAST_NS: AtomicU64 = AtomicU64::new(0);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_nanos() as u64
}

/// Returns a unique, strictly increasing millisecond timestamp.
pub(crate) fn unique_ms() -> u64 {
    advance(&LAST_MS, now_ns() / 1_000_000)
}

/// Returns a unique, strictly increasing nanosecond timestamp.
pub(crate) fn unique_ns() -> u64 {
    advance(&LAST_NS, now_ns())
}

fn advance(last: &AtomicU64, now: u64) -> u64 {
    let mut prev = last.load(Ordering::SeqCst);
    loop {
        let next = now.max(prev + 1);
        match last.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let mut prev = unique_ns();
        for _ in 0..1000 {
            let next = unique_ns();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn millis_never_collide() {
        let a = unique_ms();
        let b = unique_ms();
        let c = unique_ms();
        assert!(a < b && b < c);
    }
}
