//! Buffer period tracking: a millisecond histogram of callback intervals.
//!
//! `collect()` runs once per audio I/O call on the audio thread. It only does
//! arithmetic on preallocated state and a couple of relaxed atomics, so it is
//! safe to call from a real-time callback.
//!
//! Intervals are rounded *up* to whole milliseconds.

#![forbid(unsafe_code)]

use crate::callback_times::LateCallbackLog;
use crate::config::NANOS_PER_MILLI;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Buckets 0..=1000 ms plus one overflow bucket.
pub const HISTOGRAM_RANGE: usize = 1002;
/// Bucket counting every interval longer than 1000 ms.
pub const OVERFLOW_BUCKET: usize = HISTOGRAM_RANGE - 1;
/// Leading intervals ignored while the stream settles.
pub const BUFFER_PERIOD_DISCARD: u32 = 10;
/// Calls the full-duplex partner must make before this side starts recording.
pub const FULL_DUPLEX_PARTNER_DISCARD: u32 = 2;
/// Lateness (ms beyond expected) that makes a callback worth a capture.
pub const LATE_CALLBACK_CAPTURE_THRESHOLD_MS: u32 = 4;

#[inline]
fn ceil_ms(nanos: u64) -> u64 {
    nanos.div_ceil(NANOS_PER_MILLI)
}

/// Interval histogram with a running maximum.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferPeriodHistogram {
    counts: Vec<u32>,
    max_ms: u32,
}

impl Default for BufferPeriodHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPeriodHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; HISTOGRAM_RANGE],
            max_ms: 0,
        }
    }

    /// Builds a histogram from externally collected counts, e.g. a native driver's.
    ///
    /// Counts beyond the histogram range are folded into the overflow bucket.
    pub fn from_counts(counts: &[u32], max_ms: u32) -> Self {
        let mut histogram = Self::new();
        for (ms, &count) in counts.iter().enumerate() {
            histogram.counts[ms.min(OVERFLOW_BUCKET)] += count;
        }
        histogram.max_ms = max_ms;
        histogram
    }

    #[inline]
    pub fn record(&mut self, ms: u32) {
        self.max_ms = self.max_ms.max(ms);
        self.counts[(ms as usize).min(OVERFLOW_BUCKET)] += 1;
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn max_ms(&self) -> u32 {
        self.max_ms
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }

    /// True when the longest interval would fall off a plot spanning `limit` ms.
    pub fn exceeds_display_range(&self, limit: u32) -> bool {
        self.max_ms > limit
    }

    pub fn clear(&mut self) {
        self.counts.fill(0);
        self.max_ms = 0;
    }
}

/// Highest lateness seen since the last `take`, shared with a non-audio poller.
#[derive(Debug, Clone, Default)]
pub struct CaptureRank(Arc<AtomicI32>);

impl CaptureRank {
    #[inline]
    pub fn raise(&self, rank: i32) {
        self.0.fetch_max(rank, Ordering::Relaxed);
    }

    pub fn peek(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns the pending rank and resets it to zero.
    pub fn take(&self) -> i32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Everything a run learned about one side's buffer periods.
#[derive(Debug, Clone)]
pub struct BufferPeriodStats {
    pub histogram: BufferPeriodHistogram,
    /// Mean squared deviation from the expected period, in ns².
    pub variance_ns2: f64,
    pub late_callbacks: LateCallbackLog,
}

impl BufferPeriodStats {
    pub fn max_ms(&self) -> u32 {
        self.histogram.max_ms()
    }

    pub fn std_dev_ms(&self) -> f64 {
        self.variance_ns2.sqrt() / NANOS_PER_MILLI as f64
    }
}

/// Per-side tracker owned by the audio thread.
#[derive(Debug)]
pub struct BufferPeriodTracker {
    expected_ms: u32,
    epoch: Option<Instant>,
    previous: Option<Instant>,
    intervals: u32,
    calls: Arc<AtomicU32>,
    partner_calls: Option<Arc<AtomicU32>>,
    histogram: BufferPeriodHistogram,
    sdm_ns2: u128,
    recorded: u64,
    late_callbacks: LateCallbackLog,
    capture_rank: CaptureRank,
}

impl BufferPeriodTracker {
    pub fn new(expected_ms: u32, late_callback_capacity: usize) -> Self {
        Self {
            expected_ms,
            epoch: None,
            previous: None,
            intervals: 0,
            calls: Arc::new(AtomicU32::new(0)),
            partner_calls: None,
            histogram: BufferPeriodHistogram::new(),
            sdm_ns2: 0,
            recorded: 0,
            late_callbacks: LateCallbackLog::new(late_callback_capacity, expected_ms),
            capture_rank: CaptureRank::default(),
        }
    }

    /// Holds off recording until `partner` has passed its own warm-up.
    pub fn with_full_duplex_partner(mut self, partner: Arc<AtomicU32>) -> Self {
        self.partner_calls = Some(partner);
        self
    }

    /// Call counter a full-duplex partner can gate on.
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }

    /// Handle for polling the late-callback capture rank from another thread.
    pub fn capture_rank(&self) -> CaptureRank {
        self.capture_rank.clone()
    }

    #[inline]
    pub fn collect(&mut self) {
        self.collect_at(Instant::now());
    }

    /// Records a call that happened at `now`.
    pub fn collect_at(&mut self, now: Instant) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let epoch = *self.epoch.get_or_insert(now);
        if let Some(previous) = self.previous {
            self.intervals = self.intervals.saturating_add(1);
            let partner_ready = self
                .partner_calls
                .as_ref()
                .map_or(true, |calls| calls.load(Ordering::Relaxed) > FULL_DUPLEX_PARTNER_DISCARD);
            if self.intervals > BUFFER_PERIOD_DISCARD && partner_ready {
                let interval_ns = now.saturating_duration_since(previous).as_nanos() as u64;
                let since_epoch_ns = now.saturating_duration_since(epoch).as_nanos() as u64;
                self.record(interval_ns, since_epoch_ns);
            }
        }
        self.previous = Some(now);
    }

    #[inline]
    fn record(&mut self, interval_ns: u64, since_epoch_ns: u64) {
        let ms = ceil_ms(interval_ns).min(u64::from(u32::MAX)) as u32;
        self.histogram.record(ms);

        let expected_ns = i128::from(self.expected_ms) * i128::from(NANOS_PER_MILLI);
        let delta = i128::from(interval_ns) - expected_ns;
        self.sdm_ns2 += (delta * delta) as u128;
        self.recorded += 1;

        if ms > self.expected_ms + LATE_CALLBACK_CAPTURE_THRESHOLD_MS {
            let lateness = (ms - self.expected_ms).min(i32::MAX as u32) as i32;
            self.capture_rank.raise(lateness);
        }

        let timestamp_ms = ceil_ms(since_epoch_ns).min(u64::from(u32::MAX)) as u32;
        self.late_callbacks.record(timestamp_ms, ms);
    }

    pub fn expected_ms(&self) -> u32 {
        self.expected_ms
    }

    pub fn histogram(&self) -> &BufferPeriodHistogram {
        &self.histogram
    }

    pub fn max_ms(&self) -> u32 {
        self.histogram.max_ms()
    }

    pub fn late_callbacks(&self) -> &LateCallbackLog {
        &self.late_callbacks
    }

    /// Intervals that made it into the histogram.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Mean squared deviation from the expected period in ns².
    ///
    /// Zero until at least two intervals were recorded.
    pub fn variance_ns2(&self) -> f64 {
        if self.recorded < 2 {
            return 0.0;
        }
        self.sdm_ns2 as f64 / self.recorded as f64
    }

    /// Copies the results out for reporting.
    pub fn stats(&self) -> BufferPeriodStats {
        BufferPeriodStats {
            histogram: self.histogram.clone(),
            variance_ns2: self.variance_ns2(),
            late_callbacks: self.late_callbacks.clone(),
        }
    }

    /// Clears all state so the tracker can serve another run.
    pub fn reset(&mut self) {
        self.epoch = None;
        self.previous = None;
        self.intervals = 0;
        self.calls.store(0, Ordering::Relaxed);
        self.histogram.clear();
        self.sdm_ns2 = 0;
        self.recorded = 0;
        self.late_callbacks.clear();
        self.capture_rank.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drive(tracker: &mut BufferPeriodTracker, start: Instant, periods_ms: &[u64]) -> Instant {
        let mut now = start;
        tracker.collect_at(now);
        for &ms in periods_ms {
            now += Duration::from_millis(ms);
            tracker.collect_at(now);
        }
        now
    }

    #[test]
    fn steady_twenty_ms_fills_one_bucket() {
        let mut tracker = BufferPeriodTracker::new(20, 16);
        drive(&mut tracker, Instant::now(), &[20; 99]);
        assert_eq!(tracker.histogram().counts()[20], 89);
        assert_eq!(tracker.histogram().total(), 89);
        assert_eq!(tracker.max_ms(), 20);
        assert!(tracker.late_callbacks().is_empty());
        assert_eq!(tracker.variance_ns2(), 0.0);
    }

    #[test]
    fn warm_up_intervals_are_ignored() {
        let mut tracker = BufferPeriodTracker::new(10, 16);
        let mut periods = vec![500u64; 10];
        periods.extend([10; 5]);
        drive(&mut tracker, Instant::now(), &periods);
        assert_eq!(tracker.max_ms(), 10);
        assert_eq!(tracker.histogram().counts()[10], 5);
    }

    #[test]
    fn rounds_up_partial_milliseconds() {
        let mut tracker = BufferPeriodTracker::new(10, 16);
        let mut now = Instant::now();
        for _ in 0..12 {
            tracker.collect_at(now);
            now += Duration::from_micros(10_100);
        }
        tracker.collect_at(now);
        assert_eq!(tracker.histogram().counts()[11], 2);
    }

    #[test]
    fn overflow_bucket_catches_long_stalls() {
        let mut tracker = BufferPeriodTracker::new(10, 16);
        let mut periods = vec![10u64; 10];
        periods.push(2500);
        drive(&mut tracker, Instant::now(), &periods);
        assert_eq!(tracker.histogram().counts()[OVERFLOW_BUCKET], 1);
        assert_eq!(tracker.max_ms(), 2500);
        assert!(tracker.histogram().exceeds_display_range(1000));
    }

    #[test]
    fn late_callbacks_logged_with_timestamps_and_rank_raised() {
        let mut tracker = BufferPeriodTracker::new(10, 16);
        let mut periods = vec![10u64; 10];
        periods.extend([10, 30, 10, 17, 12]);
        drive(&mut tracker, Instant::now(), &periods);
        let late: Vec<_> = tracker.late_callbacks().iter().map(|e| (e.timestamp_ms, e.duration_ms)).collect();
        assert_eq!(late, vec![(140, 30), (167, 17), (179, 12)]);
        assert_eq!(tracker.capture_rank().take(), 20);
        assert_eq!(tracker.capture_rank().peek(), 0);
    }

    #[test]
    fn variance_tracks_deviation() {
        let mut tracker = BufferPeriodTracker::new(10, 16);
        let mut periods = vec![10u64; 10];
        periods.extend([12, 8]);
        drive(&mut tracker, Instant::now(), &periods);
        // deviations of +-2 ms
        let expected = (2.0 * NANOS_PER_MILLI as f64).powi(2);
        assert!((tracker.variance_ns2() - expected).abs() < 1.0);
        assert!((tracker.stats().std_dev_ms() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn waits_for_full_duplex_partner() {
        let partner = BufferPeriodTracker::new(10, 4);
        let mut tracker = BufferPeriodTracker::new(10, 4).with_full_duplex_partner(partner.call_counter());
        drive(&mut tracker, Instant::now(), &[10; 20]);
        assert_eq!(tracker.recorded(), 0);
        partner.call_counter().store(3, Ordering::Relaxed);
        drive(&mut tracker, Instant::now(), &[10; 2]);
        assert_eq!(tracker.recorded(), 3);
    }

    #[test]
    fn reset_clears_everything() {
        let mut tracker = BufferPeriodTracker::new(10, 4);
        let mut periods = vec![10u64; 10];
        periods.extend([40; 6]);
        drive(&mut tracker, Instant::now(), &periods);
        assert!(tracker.late_callbacks().capacity_exceeded());
        tracker.reset();
        assert_eq!(tracker.histogram().total(), 0);
        assert_eq!(tracker.max_ms(), 0);
        assert!(!tracker.late_callbacks().capacity_exceeded());
        assert_eq!(tracker.capture_rank().peek(), 0);
        drive(&mut tracker, Instant::now(), &[10; 11]);
        assert_eq!(tracker.recorded(), 1);
    }

    #[test]
    fn histogram_from_native_counts_folds_overflow() {
        let mut counts = vec![0u32; 1100];
        counts[5] = 3;
        counts[1050] = 2;
        let histogram = BufferPeriodHistogram::from_counts(&counts, 1050);
        assert_eq!(histogram.counts()[5], 3);
        assert_eq!(histogram.counts()[OVERFLOW_BUCKET], 2);
        assert_eq!(histogram.total(), 5);
    }
}
