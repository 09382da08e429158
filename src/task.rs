//! Thread-per-role plumbing: cooperative stop tokens and bounded joins.

#![forbid(unsafe_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a thread to finish.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Withdraws a stop request so the token can end another run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps up to `duration` in short slices. Returns `true` if stop was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(JOIN_POLL));
        }
    }
}

/// Spawns a named thread.
pub fn spawn_named<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Why a bounded join produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// The thread was still running at the deadline and has been left detached.
    TimedOut,
    /// The thread panicked.
    Panicked,
}

/// Joins `handle`, giving up after `timeout`.
///
/// A timed-out thread keeps running detached; callers treat that as
/// best-effort cleanup and move on.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> Result<T, JoinFailure> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                "thread {:?} did not finish within {:?}",
                handle.thread().name().unwrap_or("<unnamed>"),
                timeout
            );
            return Err(JoinFailure::TimedOut);
        }
        thread::sleep(JOIN_POLL);
    }
    handle.join().map_err(|_| JoinFailure::Panicked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_token_is_shared() {
        let token = StopToken::new();
        let other = token.clone();
        assert!(!other.is_stopped());
        token.stop();
        assert!(other.is_stopped());
        assert!(other.sleep(Duration::from_secs(5)));
        other.reset();
        assert!(!token.is_stopped());
    }

    #[test]
    fn bounded_join_returns_value() {
        let handle = spawn_named("join-ok", || 42).unwrap();
        assert_eq!(join_with_timeout(handle, Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn bounded_join_times_out() {
        let stop = StopToken::new();
        let inner = stop.clone();
        let handle = spawn_named("join-slow", move || {
            inner.sleep(Duration::from_secs(10));
        })
        .unwrap();
        assert_eq!(
            join_with_timeout(handle, Duration::from_millis(20)),
            Err(JoinFailure::TimedOut)
        );
        stop.stop();
    }
}
