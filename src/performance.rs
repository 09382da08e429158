//! Scores a buffer-period histogram against the expected period.

#![forbid(unsafe_code)]

use crate::buffer_period::BufferPeriodHistogram;
use crate::invariant_ppt::{assert_invariant, TRIM_WITHIN_TOTAL};
use log::{debug, info};

/// Share of periods near the expected one below which buffer sizes mismatch.
pub const PERCENT_OCCURRENCE_THRESHOLD: f64 = 0.95;
/// Periods at or beyond `expected * OUTLIERS_THRESHOLD` are outliers.
pub const OUTLIERS_THRESHOLD: u32 = 3;
/// Scales the benchmark into a readable range.
pub const BENCHMARK_MULTIPLIER: f64 = 10_000.0;
/// Buckets on either side of the expected period counted as on time.
pub const ACCEPTABLE_OFFSET: u32 = 2;
/// Fraction of occurrences trimmed from each tail.
pub const TRIM_FRACTION: f64 = 0.005;

/// Mean and standard deviation of a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrimmedStats {
    pub mean: f64,
    pub std_dev: f64,
    /// Occurrences left after trimming.
    pub kept: u64,
}

/// Everything `measure` derives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSummary {
    pub expected_ms: u32,
    pub total: u64,
    /// 0.0..=1.0
    pub percent_at_expected: f64,
    pub mismatch: bool,
    pub benchmark: f64,
    pub outliers: u64,
    pub max_period_ms: u32,
    pub untrimmed: TrimmedStats,
    pub trimmed: TrimmedStats,
}

impl PerformanceSummary {
    /// Thousandths of a percent of callbacks away from the expected period.
    pub fn kth_percent_late(&self) -> f64 {
        (1.0 - self.percent_at_expected) * 100_000.0
    }
}

/// Measurement over `counts[i]` = occurrences of an `i` ms period.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceMeasurement<'a> {
    expected_ms: u32,
    counts: &'a [u32],
    total: u64,
}

impl<'a> PerformanceMeasurement<'a> {
    pub fn new(expected_ms: u32, counts: &'a [u32]) -> Self {
        Self {
            expected_ms,
            counts,
            total: counts.iter().map(|&c| u64::from(c)).sum(),
        }
    }

    /// Measures buckets `0..=max` of `histogram`, the range that holds data.
    pub fn from_histogram(expected_ms: u32, histogram: &'a BufferPeriodHistogram) -> Self {
        let counts = histogram.counts();
        let useful = (histogram.max_ms() as usize + 1).min(counts.len());
        Self::new(expected_ms, &counts[..useful])
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// A zero expected period or an empty histogram leaves nothing to score.
    fn is_measurable(&self) -> bool {
        self.total > 0 && self.expected_ms > 0 && !self.counts.is_empty()
    }

    /// Share of periods within `±ACCEPTABLE_OFFSET` buckets of the expected one.
    pub fn percent_at_expected(&self) -> f64 {
        if !self.is_measurable() {
            return 0.0;
        }
        let start = self.expected_ms.saturating_sub(ACCEPTABLE_OFFSET) as usize;
        let end = (self.expected_ms as usize + ACCEPTABLE_OFFSET as usize).min(self.counts.len() - 1);
        let near: u64 = self
            .counts
            .get(start..=end)
            .map_or(0, |window| window.iter().map(|&c| u64::from(c)).sum());
        near as f64 / self.total as f64
    }

    pub fn is_mismatch(&self) -> bool {
        self.percent_at_expected() < PERCENT_OCCURRENCE_THRESHOLD
    }

    /// Squared distance from the expected period, weighted by occurrence.
    ///
    /// Skips the `expected + 1` bucket, which ceil rounding inflates, and
    /// everything from the outlier threshold up.
    pub fn weighted_benchmark(&self) -> f64 {
        if !self.is_measurable() {
            return 0.0;
        }
        let expected = self.expected_ms as usize;
        let threshold = (expected * OUTLIERS_THRESHOLD as usize).min(self.counts.len());
        let weighted: f64 = self.counts[..threshold]
            .iter()
            .enumerate()
            .filter(|&(i, &count)| count != 0 && i != expected + 1)
            .map(|(i, &count)| {
                let distance = i as f64 - expected as f64;
                distance * distance * f64::from(count)
            })
            .sum();
        weighted / expected as f64 / self.total as f64 * BENCHMARK_MULTIPLIER
    }

    /// Occurrences at or beyond `expected * OUTLIERS_THRESHOLD`.
    pub fn count_outliers(&self) -> u64 {
        if !self.is_measurable() {
            return 0;
        }
        let threshold = (self.expected_ms as usize).saturating_mul(OUTLIERS_THRESHOLD as usize);
        self.counts
            .get(threshold..)
            .map_or(0, |tail| tail.iter().map(|&c| u64::from(c)).sum())
    }

    /// Counts with the extreme `TRIM_FRACTION` removed from each tail.
    pub fn trimmed_counts(&self) -> Vec<u64> {
        let mut kept: Vec<u64> = self.counts.iter().map(|&c| u64::from(c)).collect();
        let bar = ((self.total as f64 * TRIM_FRACTION) as u64).max(1);
        trim_tail(kept.iter_mut(), bar);
        trim_tail(kept.iter_mut().rev(), bar);
        assert_invariant(
            TRIM_WITHIN_TOTAL,
            kept.iter().sum::<u64>() <= self.total,
            "trimming only removes occurrences",
            Some("trimmed_counts"),
        );
        kept
    }

    pub fn untrimmed_stats(&self) -> TrimmedStats {
        let counts: Vec<u64> = self.counts.iter().map(|&c| u64::from(c)).collect();
        histogram_stats(&counts)
    }

    pub fn trimmed_stats(&self) -> TrimmedStats {
        histogram_stats(&self.trimmed_counts())
    }

    /// Computes and logs every statistic.
    pub fn measure(&self) -> PerformanceSummary {
        let untrimmed = self.untrimmed_stats();
        let trimmed = self.trimmed_stats();
        let summary = PerformanceSummary {
            expected_ms: self.expected_ms,
            total: self.total,
            percent_at_expected: self.percent_at_expected(),
            mismatch: self.is_mismatch(),
            benchmark: self.weighted_benchmark(),
            outliers: self.count_outliers(),
            max_period_ms: self
                .counts
                .iter()
                .rposition(|&c| c != 0)
                .map_or(0, |i| i as u32),
            untrimmed,
            trimmed,
        };
        debug!(
            "mean {:.3} ms, std dev {:.3} ms before trimming",
            untrimmed.mean, untrimmed.std_dev
        );
        debug!(
            "mean {:.3} ms, std dev {:.3} ms over {} kept periods",
            trimmed.mean, trimmed.std_dev, trimmed.kept
        );
        info!(
            "expected {} ms: total {}, mismatch {}, benchmark {:.3}, outliers {}, max {} ms",
            summary.expected_ms,
            summary.total,
            summary.mismatch,
            summary.benchmark,
            summary.outliers,
            summary.max_period_ms
        );
        summary
    }
}

fn trim_tail<'b>(buckets: impl Iterator<Item = &'b mut u64>, bar: u64) {
    let mut removed = 0;
    for count in buckets {
        let take = (*count).min(bar - removed);
        *count -= take;
        removed += take;
        if removed == bar {
            break;
        }
    }
}

/// Mean and sample standard deviation (`n - 1`) of a histogram.
pub fn histogram_stats(counts: &[u64]) -> TrimmedStats {
    let n: u64 = counts.iter().sum();
    if n == 0 {
        return TrimmedStats::default();
    }
    let sum: f64 = counts
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();
    let mean = sum / n as f64;
    let std_dev = if n > 1 {
        let deviation: f64 = counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c != 0)
            .map(|(i, &c)| (i as f64 - mean).powi(2) * c as f64)
            .sum();
        (deviation / (n - 1) as f64).sqrt()
    } else {
        0.0
    };
    TrimmedStats {
        mean,
        std_dev,
        kept: n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(usize, u32)]) -> Vec<u32> {
        let len = pairs.iter().map(|&(i, _)| i + 1).max().unwrap_or(0);
        let mut out = vec![0; len];
        for &(i, c) in pairs {
            out[i] = c;
        }
        out
    }

    #[test]
    fn all_on_time_is_not_a_mismatch() {
        let data = counts(&[(10, 90), (11, 10)]);
        let m = PerformanceMeasurement::new(10, &data);
        assert_eq!(m.percent_at_expected(), 1.0);
        assert!(!m.is_mismatch());
        // Bucket 11 is excluded, bucket 10 has zero distance.
        assert_eq!(m.weighted_benchmark(), 0.0);
        assert_eq!(m.count_outliers(), 0);
    }

    #[test]
    fn benchmark_weights_squared_distance() {
        let data = counts(&[(10, 50), (14, 50)]);
        let m = PerformanceMeasurement::new(10, &data);
        // 16 * 50 / 10 / 100 * 10000
        assert!((m.weighted_benchmark() - 8000.0).abs() < 1e-9);
        assert_eq!(m.percent_at_expected(), 0.5);
        assert!(m.is_mismatch());
    }

    #[test]
    fn outliers_start_at_three_times_expected() {
        let data = counts(&[(10, 5), (29, 1), (30, 2), (45, 3)]);
        assert_eq!(PerformanceMeasurement::new(10, &data).count_outliers(), 5);
    }

    #[test]
    fn empty_histogram() {
        let summary = PerformanceMeasurement::new(10, &[]).measure();
        assert_eq!(summary.percent_at_expected, 0.0);
        assert_eq!(summary.benchmark, 0.0);
        assert_eq!(summary.outliers, 0);
        assert!(summary.mismatch);
        assert_eq!(summary.kth_percent_late(), 100_000.0);
    }

    #[test]
    fn zero_expected_period_scores_nothing() {
        let data = counts(&[(0, 4), (1, 8)]);
        let summary = PerformanceMeasurement::new(0, &data).measure();
        assert_eq!(summary.total, 12);
        assert_eq!(summary.percent_at_expected, 0.0);
        assert_eq!(summary.outliers, 0);
        assert_eq!(summary.benchmark, 0.0);
        assert!(summary.mismatch);
    }

    #[test]
    fn huge_expected_period_does_not_overflow() {
        let data = counts(&[(10, 3)]);
        let m = PerformanceMeasurement::new(u32::MAX, &data);
        assert_eq!(m.count_outliers(), 0);
        assert_eq!(m.percent_at_expected(), 0.0);
    }

    #[test]
    fn trimming_drops_one_from_each_tail_at_least() {
        let data = counts(&[(5, 1), (10, 98), (40, 1)]);
        let m = PerformanceMeasurement::new(10, &data);
        let kept = m.trimmed_counts();
        assert_eq!(kept[5], 0);
        assert_eq!(kept[40], 0);
        assert_eq!(kept[10], 98);
        let stats = m.trimmed_stats();
        assert_eq!(stats.mean, 10.0);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.kept, 98);
    }

    #[test]
    fn sample_std_dev() {
        let stats = histogram_stats(&[0, 1, 0, 1]);
        assert_eq!(stats.mean, 2.0);
        assert!((stats.std_dev - 2.0f64.sqrt()).abs() < 1e-12);
    }
}
