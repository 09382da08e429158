//! PPT invariant system: invariant enforcement with contract tracking for non-RT paths.
//!
//! `assert_invariant` takes a lock. Never call it from audio I/O paths; those
//! report through [`crate::invariant_rt`] instead.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::{Mutex, MutexGuard};

pub const RING_CAPACITY_POW2: u32 = 1;
pub const FFT_SIZE_POW2: u32 = 2;
pub const REFERENCE_CENTROID_VALID: u32 = 3;
pub const GLITCH_LOG_BOUNDED: u32 = 4;
pub const LATE_LOG_BOUNDED: u32 = 5;
pub const CAPTURE_SINGLE_FLIGHT: u32 = 6;
pub const CAPTURE_SLOT_ORDER: u32 = 7;
pub const DECK_EXCLUSIVE: u32 = 8;
pub const LATENCY_BEYOND_FLOOR: u32 = 9;
pub const TRIM_WITHIN_TOTAL: u32 = 10;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
fn invariant_log() -> MutexGuard<'static, HashSet<u32>> {
    // A panicking invariant poisons the lock; the set itself is still usable.
    INVARIANT_LOG.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = if let Some(ctx) = context {
            format!("Invariant {} failed: {} (context: {})", id, message, ctx)
        } else {
            format!("Invariant {} failed: {}", id, message)
        };
        log::error!("{}", full_message);
        panic!("{}", full_message);
    }
    invariant_log().insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {}", message);
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let missing: Vec<u32> = {
        let log = invariant_log();
        required_invariants
            .iter()
            .copied()
            .filter(|inv| !log.contains(inv))
            .collect()
    };
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    invariant_log().clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
