//! Bounded log of callbacks whose period strayed from the expected one.

#![forbid(unsafe_code)]

use std::fmt::Write as _;

/// One anomalous callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateCallback {
    /// Milliseconds since the first callback of the run, rounded up.
    pub timestamp_ms: u32,
    /// Callback period in milliseconds, rounded up.
    pub duration_ms: u16,
}

/// Fixed-capacity log. Storage is allocated up front so recording never allocates.
///
/// Once the log is full, the next anomaly sets a sticky `capacity_exceeded`
/// flag. Consumers must check it before treating the log as complete.
#[derive(Debug, Clone)]
pub struct LateCallbackLog {
    entries: Vec<LateCallback>,
    capacity: usize,
    expected_ms: u32,
    capacity_exceeded: bool,
}

impl LateCallbackLog {
    pub fn new(capacity: usize, expected_ms: u32) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            expected_ms,
            capacity_exceeded: false,
        }
    }

    /// True when `duration_ms` is more than one bucket away from the expected period.
    #[inline]
    pub fn is_anomalous(&self, duration_ms: u32) -> bool {
        duration_ms > self.expected_ms.saturating_add(1) || duration_ms.saturating_add(1) < self.expected_ms
    }

    /// Logs the callback if its duration is anomalous. RT-safe.
    ///
    /// Returns `true` if an entry was written.
    #[inline]
    pub fn record(&mut self, timestamp_ms: u32, duration_ms: u32) -> bool {
        if self.capacity_exceeded || !self.is_anomalous(duration_ms) {
            return false;
        }
        if self.entries.len() == self.capacity {
            self.capacity_exceeded = true;
            return false;
        }
        self.entries.push(LateCallback {
            timestamp_ms,
            duration_ms: duration_ms.min(u32::from(u16::MAX)) as u16,
        });
        true
    }

    pub fn entries(&self) -> &[LateCallback] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn expected_ms(&self) -> u32 {
        self.expected_ms
    }

    pub fn capacity_exceeded(&self) -> bool {
        self.capacity_exceeded
    }

    pub fn iter(&self) -> impl Iterator<Item = &LateCallback> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.capacity_exceeded = false;
    }

    /// `timestamp,duration` lines.
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.entries.len() * 12);
        for entry in &self.entries {
            let _ = writeln!(out, "{},{}", entry.timestamp_ms, entry.duration_ms);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_anomalies() {
        let mut log = LateCallbackLog::new(8, 10);
        assert!(!log.record(0, 10));
        assert!(!log.record(10, 11));
        assert!(!log.record(20, 9));
        assert!(log.record(30, 12));
        assert!(log.record(40, 8));
        assert_eq!(
            log.entries(),
            &[
                LateCallback { timestamp_ms: 30, duration_ms: 12 },
                LateCallback { timestamp_ms: 40, duration_ms: 8 },
            ]
        );
    }

    #[test]
    fn exceeded_only_after_overflow_attempt() {
        let mut log = LateCallbackLog::new(2, 5);
        log.record(1, 50);
        log.record(2, 50);
        assert_eq!(log.len(), 2);
        assert!(!log.capacity_exceeded());
        // An on-time callback does not trip the flag.
        log.record(3, 5);
        assert!(!log.capacity_exceeded());
        log.record(4, 50);
        assert!(log.capacity_exceeded());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn text_layout() {
        let mut log = LateCallbackLog::new(4, 10);
        log.record(1234, 25);
        log.record(5678, 40);
        assert_eq!(log.to_text(), "1234,25\n5678,40\n");
        log.clear();
        assert!(log.is_empty());
    }
}
