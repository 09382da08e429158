use auxide_loopback::buffer_period::{BufferPeriodTracker, BUFFER_PERIOD_DISCARD};
use auxide_loopback::performance::PerformanceMeasurement;
use auxide_loopback::report::buffer_period_text;
use proptest::prelude::*;
use std::time::{Duration, Instant};

fn drive(tracker: &mut BufferPeriodTracker, intervals_ms: &[u64]) {
    let mut now = Instant::now();
    tracker.collect_at(now);
    for &ms in intervals_ms {
        now += Duration::from_millis(ms);
        tracker.collect_at(now);
    }
}

#[test]
fn occasional_stalls_score_as_outliers() {
    let mut tracker = BufferPeriodTracker::new(10, 16);
    let rank = tracker.capture_rank();
    let mut intervals = vec![10u64; 200];
    for i in [50, 80, 110, 140, 170] {
        intervals[i] = 40;
    }
    drive(&mut tracker, &intervals);

    let stats = tracker.stats();
    assert_eq!(stats.histogram.counts()[10], 185);
    assert_eq!(stats.histogram.counts()[40], 5);
    assert_eq!(stats.late_callbacks.len(), 5);
    assert_eq!(rank.take(), 30);

    let summary = PerformanceMeasurement::from_histogram(10, &stats.histogram).measure();
    assert_eq!(summary.total, 190);
    assert!(!summary.mismatch);
    assert_eq!(summary.outliers, 5);
    assert_eq!(summary.benchmark, 0.0);
    assert_eq!(summary.max_period_ms, 40);
    // One occurrence trimmed from each tail; the bottom one sits at 10 ms.
    assert_eq!(summary.trimmed.kept, 188);
}

#[test]
fn exported_table_matches_histogram() {
    let mut tracker = BufferPeriodTracker::new(2, 4);
    let mut intervals = vec![2u64; 12];
    intervals.push(3);
    drive(&mut tracker, &intervals);
    assert_eq!(buffer_period_text(tracker.histogram()), "0\t0\n1\t0\n2\t2\n3\t1\n");
}

proptest! {
    #[test]
    fn histogram_counts_every_recorded_interval(
        intervals in proptest::collection::vec(1u64..40, 11..200),
    ) {
        let mut tracker = BufferPeriodTracker::new(10, 8);
        drive(&mut tracker, &intervals);
        let expected = (intervals.len() as u64).saturating_sub(u64::from(BUFFER_PERIOD_DISCARD));
        prop_assert_eq!(tracker.recorded(), expected);
        prop_assert_eq!(tracker.histogram().total(), expected);
        prop_assert!(tracker.late_callbacks().len() <= tracker.late_callbacks().capacity());
        let max = intervals[BUFFER_PERIOD_DISCARD as usize..].iter().copied().max().unwrap_or(0);
        prop_assert_eq!(u64::from(tracker.max_ms()), max);
    }

    #[test]
    fn trimming_never_adds_occurrences(
        intervals in proptest::collection::vec(1u64..60, 11..300),
    ) {
        let mut tracker = BufferPeriodTracker::new(10, 8);
        drive(&mut tracker, &intervals);
        let summary = PerformanceMeasurement::from_histogram(10, tracker.histogram()).measure();
        prop_assert!(summary.trimmed.kept <= summary.total);
        prop_assert!((0.0..=1.0).contains(&summary.percent_at_expected));
    }
}
