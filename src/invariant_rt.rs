//! RT-safe invariant signaling for the audio and analysis threads.
//!
//! Two tiers:
//! - **Tier 1 (RT-safe)**: lock-free signaling of invariant IDs from real-time code
//! - **Tier 2 (Non-RT)**: draining, counting and contract checks on the session thread
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! ```ignore
//! // audio thread
//! signal_invariant(&mut tx, INV_LATE_CALLBACK_LOGGED);
//!
//! // session thread
//! let signals = drain_invariant_signals(&mut rx);
//! assert!(signals.contains(&INV_LATE_CALLBACK_LOGGED));
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

// ============================================================================
// RT-Safe Invariant IDs (Tier 1)
// ============================================================================
// Integer IDs, not strings. No allocation, no formatting.

/// The analysis thread resynchronized after a ring overrun.
pub const INV_OVERRUN_RECOVERED: u8 = 1;

/// A callback outside the expected period was written to the late-callback log.
pub const INV_LATE_CALLBACK_LOGGED: u8 = 2;

/// The late-callback log refused an entry and marked itself incomplete.
pub const INV_LATE_LOG_SATURATED: u8 = 3;

/// The glitch detector flagged an FFT frame.
pub const INV_GLITCH_FLAGGED: u8 = 4;

/// The glitch log filled and set its interval-too-long flag.
pub const INV_GLITCH_LOG_SATURATED: u8 = 5;

/// An audio I/O block completed without falling back to silence.
pub const INV_RT_CALLBACK_CLEAN: u8 = 6;

/// A recorded block was forwarded to the analysis ring.
pub const INV_SAMPLES_FORWARDED: u8 = 7;

// ============================================================================
// Invariant Signal Queue
// ============================================================================

/// Capacity for each invariant signal queue.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Creates a new invariant signal queue pair.
///
/// Returns (producer for the RT thread, consumer for the session thread).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals an invariant from an RT path. A full queue drops the signal.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

// ============================================================================
// Non-RT Verification (Tier 2)
// ============================================================================

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Asserts that every required invariant was signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_OVERRUN_RECOVERED => "OVERRUN_RECOVERED",
        INV_LATE_CALLBACK_LOGGED => "LATE_CALLBACK_LOGGED",
        INV_LATE_LOG_SATURATED => "LATE_LOG_SATURATED",
        INV_GLITCH_FLAGGED => "GLITCH_FLAGGED",
        INV_GLITCH_LOG_SATURATED => "GLITCH_LOG_SATURATED",
        INV_RT_CALLBACK_CLEAN => "RT_CALLBACK_CLEAN",
        INV_SAMPLES_FORWARDED => "SAMPLES_FORWARDED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_order() {
        let (mut tx, mut rx) = new_invariant_queue();
        signal_invariant(&mut tx, INV_GLITCH_FLAGGED);
        signal_invariant(&mut tx, INV_OVERRUN_RECOVERED);
        signal_invariant(&mut tx, INV_GLITCH_FLAGGED);
        assert_eq!(
            drain_invariant_signals(&mut rx),
            vec![INV_GLITCH_FLAGGED, INV_OVERRUN_RECOVERED, INV_GLITCH_FLAGGED]
        );
    }

    #[test]
    fn counts_by_id() {
        let counts = count_invariant_signals(&[
            INV_LATE_CALLBACK_LOGGED,
            INV_LATE_CALLBACK_LOGGED,
            INV_RT_CALLBACK_CLEAN,
        ]);
        assert_eq!(counts[INV_LATE_CALLBACK_LOGGED as usize], 2);
        assert_eq!(counts[INV_RT_CALLBACK_CLEAN as usize], 1);
        assert_eq!(counts[INV_GLITCH_FLAGGED as usize], 0);
    }

    #[test]
    #[should_panic(expected = "missing invariants")]
    fn contract_fails_when_missing() {
        contract_test_rt("incomplete", &[INV_RT_CALLBACK_CLEAN], &[INV_SAMPLES_FORWARDED]);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (mut tx, mut rx) = new_invariant_queue();
        for _ in 0..INVARIANT_QUEUE_CAPACITY + 100 {
            signal_invariant(&mut tx, INV_RT_CALLBACK_CLEAN);
        }
        assert_eq!(drain_invariant_signals(&mut rx).len(), INVARIANT_QUEUE_CAPACITY);
    }

    #[test]
    fn names() {
        assert_eq!(invariant_name(INV_OVERRUN_RECOVERED), "OVERRUN_RECOVERED");
        assert_eq!(invariant_name(255), "UNKNOWN");
    }
}
