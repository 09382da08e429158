//! Round-trip latency estimation by autocorrelation of an energy envelope.
//!
//! The recorded waveform holds the injected probe and, some milliseconds later,
//! its echo through the loopback path. Downsampling `|x|` into `block_size`
//! groups and autocorrelating the envelope turns that echo into a peak at the
//! round-trip lag.

#![forbid(unsafe_code)]

use crate::config::{clamp_block_size, TestSettings, MILLIS_PER_SECOND};
use crate::invariant_ppt::{assert_invariant, LATENCY_BEYOND_FLOOR};
use log::debug;

/// Shortest latency considered. Excludes the zero-lag peak and crosstalk.
pub const MIN_LATENCY_MS: f64 = 8.0;
/// Samples quieter than -60 dB do not contribute to the envelope.
pub const AMPLITUDE_THRESHOLD: f64 = 0.001;
/// Estimates at or below this are reported as unknown.
pub const VALID_LATENCY_FLOOR_MS: f64 = 0.0001;

/// Result of one correlation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyEstimate {
    pub latency_samples: f64,
    pub latency_ms: f64,
    /// 0.0 (no confidence) to 1.0.
    pub confidence: f64,
    /// Mean of the autocorrelation tail.
    pub average: f64,
    /// RMS of the autocorrelation tail.
    pub rms: f64,
    /// Envelope index of the echo peak, if any lag beyond the floor correlated.
    pub peak_index: Option<usize>,
    /// First envelope index searched.
    pub min_index: usize,
    /// Waveform samples per envelope point.
    pub group_size: f64,
}

impl LatencyEstimate {
    pub fn is_valid(&self) -> bool {
        self.latency_ms > VALID_LATENCY_FLOOR_MS
    }
}

/// Correlation-based latency estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyEstimator {
    block_size: usize,
    sampling_rate: u32,
}

impl LatencyEstimator {
    /// `block_size` is clamped to the supported range.
    pub fn new(block_size: usize, sampling_rate: u32) -> Self {
        Self {
            block_size: clamp_block_size(block_size),
            sampling_rate,
        }
    }

    pub fn from_settings(settings: &TestSettings) -> Self {
        Self::new(settings.correlation_block_size, settings.sampling_rate)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Sums `|x|` over `block_size` equal groups of `data`.
    ///
    /// Group boundaries are fractional; a sample moves to the next group once
    /// its index passes the running boundary.
    pub fn downsample(&self, data: &[f64]) -> Vec<f64> {
        let mut envelope = vec![0.0; self.block_size];
        let group_size = data.len() as f64 / self.block_size as f64;
        let mut current = 0usize;
        let mut next_group = group_size;
        let mut ignored = 0usize;
        for (i, &sample) in data.iter().enumerate() {
            if i as f64 > next_group {
                current += 1;
                next_group += group_size;
            }
            if current >= self.block_size {
                break;
            }
            let value = sample.abs();
            if value >= AMPLITUDE_THRESHOLD {
                envelope[current] += value;
            } else {
                ignored += 1;
            }
        }
        debug!("envelope: {ignored}/{} samples below threshold", data.len());
        envelope
    }

    /// Estimates the round-trip latency in `data`.
    ///
    /// Returns `None` when the envelope carries no energy.
    pub fn estimate(&self, data: &[f64]) -> Option<LatencyEstimate> {
        debug!("correlating {} samples", data.len());
        let envelope = self.downsample(data);
        let correlation = autocorrelate(&envelope)?;

        let group_size = data.len() as f64 / self.block_size as f64;
        let rate = f64::from(self.sampling_rate.max(1));
        let millis = f64::from(MILLIS_PER_SECOND);
        let min_index = (0.5 + MIN_LATENCY_MS * rate / (group_size * millis)) as usize;

        let mut peak = 0.0;
        let mut peak_index = None;
        let mut sum = 0.0;
        let mut sum_squares = 0.0;
        for (i, &value) in correlation.iter().enumerate().skip(min_index) {
            sum += value;
            sum_squares += value * value;
            if value > peak {
                peak = value;
                peak_index = Some(i);
            }
        }
        let len = correlation.len() as f64;
        let average = sum / len;
        let rms = (sum_squares / len).sqrt();
        let confidence = if average > 0.0 {
            ((rms - average) / (3.0 * average)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        assert_invariant(
            LATENCY_BEYOND_FLOOR,
            peak_index.map_or(true, |i| i >= min_index),
            "echo peak lies beyond the minimum latency",
            Some("LatencyEstimator::estimate"),
        );

        let latency_samples = peak_index.map_or(0.0, |i| i as f64 * group_size);
        let latency_ms = latency_samples * millis / rate;
        debug!(
            "peak {peak:.4} at {peak_index:?}/{} (floor {min_index}), average {average:.3}, rms {rms:.3}",
            correlation.len()
        );
        debug!("latency {latency_samples:.2} samples, {latency_ms:.2} ms, confidence {confidence:.2}");

        Some(LatencyEstimate {
            latency_samples,
            latency_ms,
            confidence,
            average,
            rms,
            peak_index,
            min_index,
            group_size,
        })
    }
}

/// Non-circular autocorrelation normalized by the zero-lag energy.
///
/// `None` when `envelope` is all zeros.
pub fn autocorrelate(envelope: &[f64]) -> Option<Vec<f64>> {
    let energy: f64 = envelope.iter().map(|v| v * v).sum();
    if energy <= 0.0 {
        return None;
    }
    let n = envelope.len();
    Some(
        (0..n)
            .map(|lag| {
                envelope[..n - lag]
                    .iter()
                    .zip(&envelope[lag..])
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
                    / energy
            })
            .collect(),
    )
}
